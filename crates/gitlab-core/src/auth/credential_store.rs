use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{restrict_permissions, ConfigLocator, SECRET_FILE_MODE};

use super::{AuthError, AuthToken};

/// Keys understood by the per-host configuration store.
pub mod keys {
    pub const IS_OAUTH2: &str = "is_oauth2";
    pub const TOKEN: &str = "token";
    pub const REFRESH_TOKEN: &str = "oauth2_refresh_token";
    pub const CODE_VERIFIER: &str = "oauth2_code_verifier";
    pub const EXPIRY_DATE: &str = "oauth2_expiry_date";
    pub const CLIENT_ID: &str = "client_id";
    pub const BROWSER: &str = "browser";
    pub const API_PROTOCOL: &str = "api_protocol";
}

const CREDENTIAL_KEYS: [&str; 5] = [
    keys::TOKEN,
    keys::IS_OAUTH2,
    keys::REFRESH_TOKEN,
    keys::CODE_VERIFIER,
    keys::EXPIRY_DATE,
];

/// String key/value settings scoped per remote host.
///
/// `set` and `remove` only touch memory; `write` makes the changes durable.
pub trait ConfigStore {
    fn get(&self, host: &str, key: &str) -> Result<Option<String>, AuthError>;
    fn set(&mut self, host: &str, key: &str, value: &str) -> Result<(), AuthError>;
    fn remove(&mut self, host: &str, key: &str) -> Result<(), AuthError>;
    fn write(&mut self) -> Result<(), AuthError>;
}

/// Credential persisted for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCredential {
    OAuth2(AuthToken),
    PersonalToken(String),
}

impl HostCredential {
    /// Read the credential stored for `host`, if any.
    pub fn load<S>(store: &S, host: &str) -> Result<Option<Self>, AuthError>
    where
        S: ConfigStore + ?Sized,
    {
        let Some(access_token) = non_blank(store.get(host, keys::TOKEN)?) else {
            return Ok(None);
        };

        if store.get(host, keys::IS_OAUTH2)?.as_deref() != Some("true") {
            return Ok(Some(HostCredential::PersonalToken(access_token)));
        }

        let require = |key: &'static str| -> Result<String, AuthError> {
            non_blank(store.get(host, key)?).ok_or_else(|| AuthError::IncompleteCredential {
                host: host.to_owned(),
                key,
            })
        };
        let refresh_token = require(keys::REFRESH_TOKEN)?;
        let code_verifier = require(keys::CODE_VERIFIER)?;
        let expiry_date = parse_expiry(&require(keys::EXPIRY_DATE)?)?;

        Ok(Some(HostCredential::OAuth2(AuthToken {
            access_token,
            refresh_token,
            code_verifier,
            expiry_date,
        })))
    }

    /// Replace every credential key for `host`. Callers flush with [`ConfigStore::write`].
    pub fn save<S>(&self, store: &mut S, host: &str) -> Result<(), AuthError>
    where
        S: ConfigStore + ?Sized,
    {
        match self {
            HostCredential::OAuth2(token) => {
                store.set(host, keys::TOKEN, &token.access_token)?;
                store.set(host, keys::REFRESH_TOKEN, &token.refresh_token)?;
                store.set(host, keys::CODE_VERIFIER, &token.code_verifier)?;
                store.set(host, keys::EXPIRY_DATE, &format_expiry(token.expiry_date))?;
                store.set(host, keys::IS_OAUTH2, "true")?;
            }
            HostCredential::PersonalToken(value) => {
                Self::clear(store, host)?;
                store.set(host, keys::TOKEN, value)?;
                store.set(host, keys::IS_OAUTH2, "false")?;
            }
        }
        Ok(())
    }

    /// Drop every credential key for `host`, keeping its other settings.
    pub fn clear<S>(store: &mut S, host: &str) -> Result<(), AuthError>
    where
        S: ConfigStore + ?Sized,
    {
        for key in CREDENTIAL_KEYS {
            store.remove(host, key)?;
        }
        Ok(())
    }
}

/// Non-credential settings that shape the login flow for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub client_id: Option<String>,
    pub api_protocol: String,
    pub browser: Option<String>,
}

impl HostSettings {
    pub fn load<S>(store: &S, host: &str) -> Result<Self, AuthError>
    where
        S: ConfigStore + ?Sized,
    {
        let api_protocol = match non_blank(store.get(host, keys::API_PROTOCOL)?) {
            None => "https".to_owned(),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "https" | "http" => value.to_ascii_lowercase(),
                _ => return Err(AuthError::UnsupportedProtocol(value)),
            },
        };
        Ok(Self {
            client_id: non_blank(store.get(host, keys::CLIENT_ID)?),
            api_protocol,
            browser: non_blank(store.get(host, keys::BROWSER)?),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub(crate) fn format_expiry(expiry: DateTime<Utc>) -> String {
    expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_expiry(raw: &str) -> Result<DateTime<Utc>, AuthError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| AuthError::InvalidExpiryDate(raw.to_owned()))
}

/// JSON-file backed store living in the user configuration directory.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    document: HostsDocument,
}

impl FileConfigStore {
    /// Load `hosts.json` from the located configuration directory.
    pub fn open(locator: &ConfigLocator) -> Result<Self, AuthError> {
        Self::open_path(locator.hosts_file())
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Self::open(&ConfigLocator::new()?)
    }

    /// Load the store from `path`; a missing file is an empty store.
    pub fn open_path(path: PathBuf) -> Result<Self, AuthError> {
        let document = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|source| AuthError::HostsFile {
                path: path.clone(),
                source,
            })?
        } else {
            HostsDocument::default()
        };
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hostnames with at least one setting.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.document.hosts.keys().map(String::as_str)
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        restrict_permissions(path, SECRET_FILE_MODE)?;

        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, host: &str, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self
            .document
            .hosts
            .get(host)
            .and_then(|settings| settings.get(key))
            .cloned())
    }

    fn set(&mut self, host: &str, key: &str, value: &str) -> Result<(), AuthError> {
        self.document
            .hosts
            .entry(host.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, host: &str, key: &str) -> Result<(), AuthError> {
        if let Some(settings) = self.document.hosts.get_mut(host) {
            settings.remove(key);
            if settings.is_empty() {
                self.document.hosts.remove(host);
            }
        }
        Ok(())
    }

    fn write(&mut self) -> Result<(), AuthError> {
        let payload =
            serde_json::to_string_pretty(&self.document).map_err(|source| AuthError::HostsFile {
                path: self.path.clone(),
                source,
            })?;
        Self::write_file(&self.path, &payload)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HostsDocument {
    version: u32,
    #[serde(default)]
    hosts: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for HostsDocument {
    fn default() -> Self {
        Self {
            version: 1,
            hosts: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::MemoryStore;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn sample_token() -> AuthToken {
        AuthToken {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            code_verifier: "verifier".into(),
            expiry_date: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hosts.json");
        let mut store = FileConfigStore::open_path(path.clone()).unwrap();
        HostCredential::OAuth2(sample_token())
            .save(&mut store, "gitlab.com")
            .unwrap();
        store
            .set("gitlab.example.com", keys::CLIENT_ID, "abc")
            .unwrap();
        store.write().unwrap();

        let reopened = FileConfigStore::open_path(path).unwrap();
        let loaded = HostCredential::load(&reopened, "gitlab.com").unwrap();
        assert_eq!(loaded, Some(HostCredential::OAuth2(sample_token())));
        assert_eq!(
            reopened
                .get("gitlab.com", keys::EXPIRY_DATE)
                .unwrap()
                .as_deref(),
            Some("2030-01-02T03:04:05Z")
        );
        assert_eq!(
            reopened.hosts().collect::<Vec<_>>(),
            vec!["gitlab.com", "gitlab.example.com"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("hosts.json");
        let mut store = FileConfigStore::open_path(path.clone()).unwrap();
        store.set("gitlab.com", keys::TOKEN, "secret").unwrap();
        store.write().unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hosts.json");
        fs::write(&path, "{not json").unwrap();
        let err = FileConfigStore::open_path(path).unwrap_err();
        assert!(matches!(err, AuthError::HostsFile { .. }));
    }

    #[test]
    fn missing_host_has_no_credential() {
        let store = MemoryStore::default();
        assert!(HostCredential::load(&store, "gitlab.com").unwrap().is_none());
    }

    #[test]
    fn unflagged_token_is_personal() {
        let mut store = MemoryStore::default();
        store.set("gitlab.com", keys::TOKEN, "glpat-123").unwrap();
        assert_eq!(
            HostCredential::load(&store, "gitlab.com").unwrap(),
            Some(HostCredential::PersonalToken("glpat-123".into()))
        );
    }

    #[test]
    fn oauth_credential_requires_every_key() {
        let mut store = MemoryStore::default();
        HostCredential::OAuth2(sample_token())
            .save(&mut store, "gitlab.com")
            .unwrap();
        store.remove("gitlab.com", keys::CODE_VERIFIER).unwrap();
        let err = HostCredential::load(&store, "gitlab.com").unwrap_err();
        assert!(matches!(
            err,
            AuthError::IncompleteCredential {
                key: keys::CODE_VERIFIER,
                ..
            }
        ));
    }

    #[test]
    fn invalid_expiry_is_an_error() {
        let mut store = MemoryStore::default();
        HostCredential::OAuth2(sample_token())
            .save(&mut store, "gitlab.com")
            .unwrap();
        store
            .set("gitlab.com", keys::EXPIRY_DATE, "02 Jan 30 03:04 UTC")
            .unwrap();
        let err = HostCredential::load(&store, "gitlab.com").unwrap_err();
        assert!(matches!(err, AuthError::InvalidExpiryDate(_)));
    }

    #[test]
    fn personal_token_replaces_oauth_keys() {
        let mut store = MemoryStore::default();
        HostCredential::OAuth2(sample_token())
            .save(&mut store, "gitlab.com")
            .unwrap();
        HostCredential::PersonalToken("glpat-123".into())
            .save(&mut store, "gitlab.com")
            .unwrap();
        assert_eq!(store.value("gitlab.com", keys::IS_OAUTH2), Some("false"));
        assert_eq!(store.value("gitlab.com", keys::REFRESH_TOKEN), None);
        assert_eq!(store.value("gitlab.com", keys::EXPIRY_DATE), None);
    }

    #[test]
    fn clear_keeps_host_settings() {
        let mut store = MemoryStore::default();
        store.set("gitlab.example.com", keys::CLIENT_ID, "abc").unwrap();
        HostCredential::OAuth2(sample_token())
            .save(&mut store, "gitlab.example.com")
            .unwrap();
        HostCredential::clear(&mut store, "gitlab.example.com").unwrap();
        assert!(HostCredential::load(&store, "gitlab.example.com")
            .unwrap()
            .is_none());
        assert_eq!(store.value("gitlab.example.com", keys::CLIENT_ID), Some("abc"));
    }

    #[test]
    fn settings_default_to_https() {
        let mut store = MemoryStore::default();
        let settings = HostSettings::load(&store, "gitlab.com").unwrap();
        assert_eq!(settings.api_protocol, "https");
        assert!(settings.client_id.is_none());

        store.set("gitlab.com", keys::API_PROTOCOL, "HTTP").unwrap();
        store.set("gitlab.com", keys::CLIENT_ID, "  ").unwrap();
        store.set("gitlab.com", keys::BROWSER, "firefox").unwrap();
        let settings = HostSettings::load(&store, "gitlab.com").unwrap();
        assert_eq!(settings.api_protocol, "http");
        assert!(settings.client_id.is_none());
        assert_eq!(settings.browser.as_deref(), Some("firefox"));

        store.set("gitlab.com", keys::API_PROTOCOL, "ftp").unwrap();
        assert!(matches!(
            HostSettings::load(&store, "gitlab.com").unwrap_err(),
            AuthError::UnsupportedProtocol(_)
        ));
    }

    #[test]
    fn expiry_text_round_trips_at_second_precision() {
        let expiry = Utc::now() + Duration::seconds(90);
        let parsed = parse_expiry(&format_expiry(expiry)).unwrap();
        assert!((expiry - parsed) < Duration::seconds(1));
        assert!(parsed <= expiry);
    }
}
