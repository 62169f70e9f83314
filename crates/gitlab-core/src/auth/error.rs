use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication and credential management routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed hosts file {}: {source}", .path.display())]
    HostsFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(#[source] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error(
        "no OAuth application configured for {host}; set `client_id` for this host \
         to the application id of an OAuth application registered on that instance"
    )]
    MissingClientId { host: String },
    #[error("unsupported API protocol '{0}' (expected http or https)")]
    UnsupportedProtocol(String),
    #[error("stored credentials for {host} are incomplete: missing `{key}`")]
    IncompleteCredential { host: String, key: &'static str },
    #[error("invalid stored expiry date '{0}'")]
    InvalidExpiryDate(String),
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("timed out after {0:?} waiting for the authorization redirect")]
    Timeout(Duration),
    #[error("authorization flow cancelled")]
    Cancelled,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("authorization request denied ({0})")]
    AccessDenied(String),
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("invalid callback request: {0}")]
    InvalidCallbackRequest(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] Box<AuthError>),
}

impl AuthError {
    /// Error variant wrapped by [`AuthError::AuthenticationFailed`], or `self`.
    pub fn root(&self) -> &AuthError {
        match self {
            AuthError::AuthenticationFailed(inner) => inner.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failed_keeps_provider_detail() {
        let err = AuthError::AuthenticationFailed(Box::new(AuthError::TokenEndpoint {
            status: StatusCode::BAD_REQUEST,
            body: r#"{"error":"invalid_grant"}"#.into(),
        }));
        let message = err.to_string();
        assert!(message.starts_with("authentication failed"));
        assert!(message.contains("invalid_grant"));
        assert!(matches!(err.root(), AuthError::TokenEndpoint { .. }));
    }
}
