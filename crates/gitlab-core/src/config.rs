use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

/// Hostname of the public GitLab instance.
pub const DEFAULT_HOSTNAME: &str = "gitlab.com";

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "GLAB_CONFIG_DIR";

/// Environment variable overriding the default hostname.
pub const HOST_ENV: &str = "GITLAB_HOST";

const HOSTS_FILE: &str = "hosts.json";

/// Mode of the configuration directory.
pub const CONFIG_DIR_MODE: u32 = 0o700;

/// Mode of files holding credentials.
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Locates the directory holding per-host configuration and credentials.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Discover the configuration directory, creating it if needed.
    ///
    /// `GLAB_CONFIG_DIR` takes precedence over the platform default.
    pub fn new() -> Result<Self, ConfigError> {
        let root = match env::var_os(CONFIG_DIR_ENV).filter(|value| !value.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("com", "gitlab", "glab")
                .ok_or(ConfigError::MissingProjectDirs)?
                .config_dir()
                .to_path_buf(),
        };
        Self::with_root(root)
    }

    /// Use an explicit directory, creating it with user-only permissions.
    pub fn with_root(root: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&root).map_err(|source| ConfigError::CreateDir {
            path: root.clone(),
            source,
        })?;
        restrict_permissions(&root, CONFIG_DIR_MODE)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the file holding per-host settings and credentials.
    pub fn hosts_file(&self) -> PathBuf {
        self.root.join(HOSTS_FILE)
    }
}

/// Hostname used when a command does not name one explicitly.
pub fn default_hostname() -> String {
    env::var(HOST_ENV)
        .ok()
        .map(|value| normalize_hostname(&value))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_owned())
}

/// Strip a scheme and trailing slashes so `https://gitlab.example.com/` and
/// `gitlab.example.com` address the same host entry.
pub fn normalize_hostname(input: &str) -> String {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_ascii_lowercase()
}

/// Limit `path` to `mode` on Unix; other platforms keep their defaults.
pub fn restrict_permissions(path: &Path, mode: u32) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
            ConfigError::Permissions {
                path: path.to_path_buf(),
                mode,
                source,
            }
        })
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Errors raised while locating or preparing the configuration directory.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no home directory found to hold glab configuration; set GLAB_CONFIG_DIR")]
    MissingProjectDirs,
    #[error("failed to create configuration directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to set mode {mode:o} on {}: {source}", .path.display())]
    Permissions {
        path: PathBuf,
        mode: u32,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn hosts_file_lives_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::with_root(temp_dir.path().join("glab")).unwrap();
        assert!(locator.root().is_dir());
        assert!(locator.hosts_file().ends_with("glab/hosts.json"));
    }

    #[cfg(unix)]
    #[test]
    fn root_is_user_only() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::with_root(temp_dir.path().join("glab")).unwrap();
        let mode = fs::metadata(locator.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn create_dir_error_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let err = ConfigLocator::with_root(blocker.join("glab")).unwrap_err();
        assert!(matches!(err, ConfigError::CreateDir { .. }));
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[cfg(unix)]
    #[test]
    fn restrict_permissions_sets_mode_and_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("hosts.json");
        fs::write(&file, "{}").unwrap();

        restrict_permissions(&file, SECRET_FILE_MODE).unwrap();
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let missing = temp_dir.path().join("missing.json");
        let err = restrict_permissions(&missing, SECRET_FILE_MODE).unwrap_err();
        assert!(matches!(err, ConfigError::Permissions { mode: 0o600, .. }));
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn normalize_strips_scheme_and_slash() {
        assert_eq!(
            normalize_hostname("https://GitLab.Example.com/"),
            "gitlab.example.com"
        );
        assert_eq!(normalize_hostname("gitlab.com"), "gitlab.com");
        assert_eq!(normalize_hostname("http://10.0.0.5:8080"), "10.0.0.5:8080");
    }
}
