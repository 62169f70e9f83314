use chrono::{DateTime, Duration, Utc};

/// OAuth credential stored for a single host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: String,
    /// Verifier of the authorization that minted the first token for this host.
    /// Every refresh grant sends it again.
    pub code_verifier: String,
    pub expiry_date: DateTime<Utc>,
}

impl AuthToken {
    /// A token is valid while its expiry lies strictly in the future.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date <= now
    }
}

/// Result of a token endpoint call.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: AuthToken,
    /// Lifetime in seconds as reported by the server.
    pub expires_in: u32,
    pub received_at: DateTime<Utc>,
}

impl TokenGrant {
    pub(crate) fn new(
        access_token: String,
        refresh_token: String,
        code_verifier: String,
        expires_in: u32,
        received_at: DateTime<Utc>,
    ) -> Self {
        let expiry_date = received_at + Duration::seconds(i64::from(expires_in));
        Self {
            token: AuthToken {
                access_token,
                refresh_token,
                code_verifier,
                expiry_date,
            },
            expires_in,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(expires_in: u32, received_at: DateTime<Utc>) -> TokenGrant {
        TokenGrant::new(
            "token".into(),
            "refresh".into(),
            "verifier".into(),
            expires_in,
            received_at,
        )
    }

    #[test]
    fn expiry_is_received_at_plus_lifetime() {
        let before = Utc::now();
        let grant = grant(60, Utc::now());
        let expiry = grant.token.expiry_date;
        assert!(expiry > before);
        assert!(expiry <= Utc::now() + Duration::seconds(60));
        assert_eq!(expiry - grant.received_at, Duration::seconds(60));
    }

    #[test]
    fn expiry_detection_uses_strict_comparison() {
        let received_at = Utc::now();
        let token = grant(60, received_at).token;
        assert!(!token.is_expired_at(received_at));
        assert!(!token.is_expired_at(received_at + Duration::seconds(59)));
        assert!(token.is_expired_at(received_at + Duration::seconds(60)));
        assert!(token.is_expired_at(received_at + Duration::seconds(61)));
    }

    #[test]
    fn zero_lifetime_is_immediately_expired() {
        let token = grant(0, Utc::now()).token;
        assert!(token.is_expired());
    }
}
