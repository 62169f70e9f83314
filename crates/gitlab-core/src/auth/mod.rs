mod browser;
mod callback;
mod credential_store;
mod error;
mod oauth;
mod orchestrator;
mod pkce;
mod token;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use browser::{BrowserLauncher, SystemBrowser};
pub use callback::{CallbackHandle, LoopbackServer, RedirectConfig};
pub use credential_store::{keys, ConfigStore, FileConfigStore, HostCredential, HostSettings};
pub use error::AuthError;
pub use oauth::{
    resolve_client_id, AuthorizationRequest, OAuthClient, OAuthConfig, OAuthEndpoints, DEFAULT_CLIENT_ID,
    DEFAULT_REDIRECT_HOST, DEFAULT_REDIRECT_PATH, DEFAULT_REDIRECT_PORT, DEFAULT_SCOPES,
};
pub use orchestrator::{AuthManager, CredentialKind, HostStatus, DEFAULT_LOGIN_TIMEOUT};
pub use pkce::{generate_code_challenge, generate_code_verifier, PkcePair};
pub use token::{AuthToken, TokenGrant};
