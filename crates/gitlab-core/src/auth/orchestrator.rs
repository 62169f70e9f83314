use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::oauth::resolve_client_id;
use super::{
    keys, AuthError, AuthToken, AuthorizationRequest, BrowserLauncher, ConfigStore, HostCredential,
    HostSettings, LoopbackServer, OAuthClient, OAuthConfig, OAuthEndpoints, RedirectConfig,
};

/// How long a login waits for the browser redirect.
pub const DEFAULT_LOGIN_TIMEOUT: StdDuration = StdDuration::from_secs(5 * 60);

/// Kind of credential stored for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    OAuth2,
    PersonalToken,
}

/// Summary of a host's stored credential after any pending refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub host: String,
    pub kind: CredentialKind,
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Coordinates browser login, token refresh, and credential persistence.
pub struct AuthManager<S> {
    store: Arc<Mutex<S>>,
    http: Client,
    redirect: RedirectConfig,
    login_timeout: StdDuration,
    refresh_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S> AuthManager<S>
where
    S: ConfigStore + Send,
{
    pub fn new(store: S) -> Result<Self, AuthError> {
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            http: OAuthClient::http_client()?,
            redirect: RedirectConfig::default(),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            refresh_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn with_redirect(mut self, redirect: RedirectConfig) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn with_login_timeout(mut self, timeout: StdDuration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.store)
    }

    /// Run the browser login for `host` and persist the resulting token.
    ///
    /// `notify` receives the authorization URL before the browser is launched.
    /// A browser that fails to open only produces a warning; the flow keeps
    /// waiting until the redirect arrives, the login timeout elapses, or
    /// `cancel` resolves.
    pub async fn login<B, N, C>(
        &self,
        host: &str,
        browser: &B,
        notify: N,
        cancel: C,
    ) -> Result<AuthToken, AuthError>
    where
        B: BrowserLauncher + ?Sized,
        N: Fn(&Url) -> Result<(), AuthError>,
        C: Future<Output = ()>,
    {
        let settings = self.settings(host).await?;
        let client_id = resolve_client_id(host, &settings)?;
        let endpoints = OAuthEndpoints::for_host(host, &settings.api_protocol)?;
        let request = AuthorizationRequest::generate();

        let loopback = LoopbackServer::bind(&self.redirect).await?;
        let config = OAuthConfig::new(client_id, loopback.redirect_uri().clone());
        let client = OAuthClient::with_http(self.http.clone(), config, endpoints);
        let auth_url = client.authorization_url(&request);
        let handle = loopback.spawn(
            client,
            request.state.clone(),
            request.pkce.verifier().to_owned(),
        );

        if let Err(err) = notify(&auth_url) {
            handle.abort().await;
            return Err(err);
        }
        if let Err(err) = browser.open(&auth_url, settings.browser.as_deref()) {
            warn!(error = %err, "could not open a browser; open the authorization URL manually");
        }

        debug!(host, "waiting for authorization redirect");
        let grant = match handle.wait(self.login_timeout, cancel).await {
            Ok(grant) => grant,
            Err(err @ (AuthError::Timeout(_) | AuthError::Cancelled)) => return Err(err),
            Err(err) => return Err(AuthError::AuthenticationFailed(Box::new(err))),
        };

        let lock = self.refresh_lock(host);
        let _guard = lock.lock().await;
        self.persist(host, &HostCredential::OAuth2(grant.token.clone()))
            .await?;
        info!(host, expires_at = %grant.token.expiry_date, "logged in");
        Ok(grant.token)
    }

    /// Refresh the OAuth token for `host` once it has expired.
    ///
    /// Returns `None` for hosts without an OAuth credential. A token whose
    /// expiry is still in the future is returned as stored.
    pub async fn refresh_if_expired(&self, host: &str) -> Result<Option<AuthToken>, AuthError> {
        let lock = self.refresh_lock(host);
        let _guard = lock.lock().await;

        let token = match self.credential(host).await? {
            Some(HostCredential::OAuth2(token)) => token,
            _ => return Ok(None),
        };
        if !token.is_expired() {
            return Ok(Some(token));
        }

        debug!(host, expired_at = %token.expiry_date, "access token expired; refreshing");
        let settings = self.settings(host).await?;
        let config = OAuthConfig::new(
            resolve_client_id(host, &settings)?,
            self.redirect.redirect_uri(self.redirect.port)?,
        );
        let endpoints = OAuthEndpoints::for_host(host, &settings.api_protocol)?;
        let client = OAuthClient::with_http(self.http.clone(), config, endpoints);
        let grant = client
            .refresh(&token.refresh_token, &token.code_verifier)
            .await?;

        self.persist(host, &HostCredential::OAuth2(grant.token.clone()))
            .await?;
        info!(host, expires_at = %grant.token.expiry_date, "access token refreshed");
        Ok(Some(grant.token))
    }

    /// Token to present on API requests to `host`, refreshed first if needed.
    pub async fn access_token(&self, host: &str) -> Result<Option<String>, AuthError> {
        if let Some(token) = self.refresh_if_expired(host).await? {
            return Ok(Some(token.access_token));
        }
        Ok(match self.credential(host).await? {
            Some(HostCredential::PersonalToken(token)) => Some(token),
            Some(HostCredential::OAuth2(token)) => Some(token.access_token),
            None => None,
        })
    }

    pub async fn status(&self, host: &str) -> Result<Option<HostStatus>, AuthError> {
        if let Some(token) = self.refresh_if_expired(host).await? {
            return Ok(Some(HostStatus {
                host: host.to_owned(),
                kind: CredentialKind::OAuth2,
                expiry_date: Some(token.expiry_date),
            }));
        }
        Ok(self.credential(host).await?.map(|credential| HostStatus {
            host: host.to_owned(),
            kind: match credential {
                HostCredential::OAuth2(_) => CredentialKind::OAuth2,
                HostCredential::PersonalToken(_) => CredentialKind::PersonalToken,
            },
            expiry_date: None,
        }))
    }

    /// Store a personal access token, replacing any OAuth credential.
    pub async fn store_personal_token(&self, host: &str, token: &str) -> Result<(), AuthError> {
        self.persist(host, &HostCredential::PersonalToken(token.to_owned()))
            .await
    }

    /// Forget the credential for `host`. Returns whether one was stored.
    pub async fn logout(&self, host: &str) -> Result<bool, AuthError> {
        let lock = self.refresh_lock(host);
        let _guard = lock.lock().await;

        let mut store = self.store.lock().await;
        let existed = store.get(host, keys::TOKEN)?.is_some();
        HostCredential::clear(&mut *store, host)?;
        store.write()?;
        Ok(existed)
    }

    async fn credential(&self, host: &str) -> Result<Option<HostCredential>, AuthError> {
        let store = self.store.lock().await;
        HostCredential::load(&*store, host)
    }

    async fn settings(&self, host: &str) -> Result<HostSettings, AuthError> {
        let store = self.store.lock().await;
        HostSettings::load(&*store, host)
    }

    async fn persist(&self, host: &str, credential: &HostCredential) -> Result<(), AuthError> {
        let mut store = self.store.lock().await;
        credential.save(&mut *store, host)?;
        store.write()
    }

    fn refresh_lock(&self, host: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(host.to_owned()).or_default())
    }
}
