use std::env;

use url::Url;

use super::AuthError;

/// Opens the authorization URL for the operator.
pub trait BrowserLauncher: Send + Sync {
    /// `browser` names a specific browser command configured for the host.
    fn open(&self, url: &Url, browser: Option<&str>) -> Result<(), AuthError>;
}

impl<F> BrowserLauncher for F
where
    F: Fn(&Url, Option<&str>) -> Result<(), AuthError> + Send + Sync,
{
    fn open(&self, url: &Url, browser: Option<&str>) -> Result<(), AuthError> {
        self(url, browser)
    }
}

/// Launches the desktop browser, honouring a configured override or `$BROWSER`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &Url, browser: Option<&str>) -> Result<(), AuthError> {
        let app = browser
            .map(ToOwned::to_owned)
            .or_else(|| env::var("BROWSER").ok())
            .filter(|value| !value.trim().is_empty());
        let result = match app {
            Some(app) => open::with(url.as_str(), app),
            None => open::that(url.as_str()),
        };
        result.map_err(|err| AuthError::BrowserLaunch(err.to_string()))
    }
}
