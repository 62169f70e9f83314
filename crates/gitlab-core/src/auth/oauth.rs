use std::time::Duration as StdDuration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::{utils, AuthError, HostSettings, PkcePair, TokenGrant};
use crate::config::DEFAULT_HOSTNAME;

/// Application id of the public OAuth application registered on gitlab.com.
pub const DEFAULT_CLIENT_ID: &str =
    "41d48f9422ebd655dd9cf2947d6979681dfaddc6d0c56f7628f6ada59559af1e";
pub const DEFAULT_REDIRECT_HOST: &str = "localhost";
pub const DEFAULT_REDIRECT_PATH: &str = "/auth/redirect";
pub const DEFAULT_REDIRECT_PORT: u16 = 7171;
pub const DEFAULT_SCOPES: &[&str; 5] = &["openid", "profile", "read_user", "write_repository", "api"];

const USER_AGENT: &str = concat!("glab-rs/", env!("CARGO_PKG_VERSION"));
const TOKEN_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Client id to present to `host`.
///
/// gitlab.com uses the public application; every other instance needs its own
/// application id configured under the host's `client_id` key.
pub fn resolve_client_id(host: &str, settings: &HostSettings) -> Result<String, AuthError> {
    if host.eq_ignore_ascii_case(DEFAULT_HOSTNAME) {
        return Ok(DEFAULT_CLIENT_ID.to_owned());
    }
    settings
        .client_id
        .clone()
        .ok_or_else(|| AuthError::MissingClientId {
            host: host.to_owned(),
        })
}

/// OAuth client configuration for a single host.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    pub fn new<S: Into<String>>(client_id: S, redirect_uri: Url) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri,
            scopes: DEFAULT_SCOPES
                .iter()
                .map(|scope| scope.to_string())
                .collect(),
        }
    }
}

/// OAuth endpoints exposed by a GitLab instance.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
}

impl OAuthEndpoints {
    /// `{protocol}://{host}/oauth/authorize` and `{protocol}://{host}/oauth/token`.
    pub fn for_host(host: &str, protocol: &str) -> Result<Self, AuthError> {
        let base = Url::parse(&format!("{protocol}://{host}/"))?;
        Ok(Self {
            authorization_url: base.join("oauth/authorize")?,
            token_url: base.join("oauth/token")?,
        })
    }
}

/// Per-attempt secrets bound into the authorization URL.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub state: String,
    pub pkce: PkcePair,
}

impl AuthorizationRequest {
    pub fn generate() -> Self {
        Self {
            state: utils::random_state(utils::STATE_LEN),
            pkce: PkcePair::generate(),
        }
    }
}

/// Performs OAuth authorization and token requests against one GitLab host.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: OAuthConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn with_endpoints(
        config: OAuthConfig,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        Ok(Self::with_http(Self::http_client()?, config, endpoints))
    }

    /// Reuse an existing HTTP client (and its connection pool).
    pub fn with_http(http: Client, config: OAuthConfig, endpoints: OAuthEndpoints) -> Self {
        Self {
            http,
            config,
            endpoints,
        }
    }

    pub(crate) fn http_client() -> Result<Client, AuthError> {
        Ok(Client::builder().user_agent(USER_AGENT).build()?)
    }

    pub fn authorization_url(&self, request: &AuthorizationRequest) -> Url {
        let mut url = self.endpoints.authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
            pairs.append_pair("response_type", "code");
            pairs.append_pair("state", &request.state);
            if !self.config.scopes.is_empty() {
                pairs.append_pair("scope", &self.config.scopes.join(" "));
            }
            pairs.append_pair("code_challenge", request.pkce.challenge());
            pairs.append_pair("code_challenge_method", "S256");
        }
        url
    }

    /// Exchange an authorization code for access/refresh tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, AuthError> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.request_token(&form, code_verifier).await
    }

    /// Mint a new access token from a refresh token.
    ///
    /// GitLab binds refresh grants to the verifier of the original authorization,
    /// so the stored verifier is sent again.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        code_verifier: &str,
    ) -> Result<TokenGrant, AuthError> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.request_token(&form, code_verifier).await
    }

    async fn request_token(
        &self,
        form: &[(&str, &str)],
        code_verifier: &str,
    ) -> Result<TokenGrant, AuthError> {
        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(form)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let received_at = Utc::now();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let body = response.text().await?;
        let payload: TokenResponse =
            serde_json::from_str(&body).map_err(AuthError::InvalidTokenResponse)?;
        Ok(TokenGrant::new(
            payload.access_token,
            payload.refresh_token,
            code_verifier.to_owned(),
            payload.expires_in,
            received_at,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u32,
}
