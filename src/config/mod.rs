//! Manager settings loaded from `config.toml`.
//!
//! Every section is optional; missing keys fall back to the defaults below,
//! which reproduce the behaviour of a bare install (port 3000, Google's
//! production endpoints, 8 second upstream timeout).
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [proxy]
//! program = "python3"
//! args = ["run_proxy.py"]
//!
//! [oauth]
//! client_id = "..."
//! client_secret = "..."
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default management port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default per-request budget for upstream API calls.
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub proxy: ProxySettings,
    pub oauth: OAuthSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used for the OAuth redirect.
    /// Defaults to `http://localhost:<port>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            public_url: None,
        }
    }
}

impl ServerSettings {
    pub fn public_url(&self) -> String {
        match self.public_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

/// Locations of persisted state. Unset entries resolve under the data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_dir: Option<PathBuf>,
}

/// The proxy program launched once per configured server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySettings {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// How long shutdown waits for each child before killing it.
    pub shutdown_grace_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["run_proxy.py".to_string()],
            working_dir: None,
            shutdown_grace_secs: 5,
        }
    }
}

/// OAuth client identity. Also backfilled into legacy credential files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthSettings {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamSettings {
    pub timeout_secs: u64,
    pub max_concurrent_probes: usize,
    pub user_agent: String,
    pub token_uri: String,
    pub auth_uri: String,
    pub userinfo_url: String,
    /// Base of the `v1internal:*` code-assist methods.
    pub code_assist_url: String,
    pub projects_url: String,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            max_concurrent_probes: 8,
            user_agent: "GeminiCLI/v0.1.5".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
            code_assist_url: "https://cloudcode-pa.googleapis.com/v1internal".to_string(),
            projects_url: "https://cloudresourcemanager.googleapis.com/v1/projects".to_string(),
        }
    }
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// URL of a code-assist method, e.g. `loadCodeAssist`.
    pub fn code_assist_method(&self, method: &str) -> String {
        format!("{}:{method}", self.code_assist_url.trim_end_matches('/'))
    }
}

impl Settings {
    /// Load settings from `path`.
    ///
    /// A missing file yields defaults. A file that fails to parse is logged
    /// and also yields defaults.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };

        match toml::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to parse settings at {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Load settings from the default location (`paths::config_file()`).
    pub fn load_default() -> Self {
        match crate::paths::config_file() {
            Some(path) => Self::load(&path),
            None => Self::default(),
        }
    }

    /// Data directory: configured, else the XDG default, else `./data`.
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .or_else(crate::paths::data_directory)
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    pub fn roster_file(&self) -> PathBuf {
        self.storage
            .roster_file
            .clone()
            .unwrap_or_else(|| crate::paths::roster_file_in(&self.data_dir()))
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.storage
            .tokens_dir
            .clone()
            .unwrap_or_else(|| crate::paths::tokens_dir_in(&self.data_dir()))
    }

    /// Directory for rolling log files; follows a configured data dir.
    pub fn log_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .as_ref()
            .map(|dir| dir.join("logs"))
            .or_else(crate::paths::log_directory)
            .unwrap_or_else(|| self.data_dir().join("logs"))
    }

    /// Redirect URI registered with the OAuth client.
    pub fn redirect_uri(&self) -> String {
        format!("{}/api/auth/callback", self.server.public_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bare_install() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.upstream.timeout(), Duration::from_secs(8));
        assert_eq!(
            settings.redirect_uri(),
            "http://localhost:3000/api/auth/callback"
        );
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [server]
            port = 4100

            [oauth]
            client_id = "cid"
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.port, 4100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.oauth.client_id, "cid");
        assert!(!settings.oauth.is_configured());
        assert_eq!(settings.proxy.program, "python3");
    }

    #[test]
    fn load_missing_file_returns_default() {
        let temp = tempfile::TempDir::new().unwrap();
        let settings = Settings::load(&temp.path().join("absent.toml"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn load_invalid_file_returns_default() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "this is not valid [[TOML").unwrap();

        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn storage_paths_resolve_under_data_dir() {
        let mut settings = Settings::default();
        settings.storage.data_dir = Some(PathBuf::from("/srv/deck"));

        assert_eq!(
            settings.roster_file(),
            PathBuf::from("/srv/deck/servers_config.json")
        );
        assert_eq!(settings.tokens_dir(), PathBuf::from("/srv/deck/tokens"));

        settings.storage.tokens_dir = Some(PathBuf::from("/elsewhere"));
        assert_eq!(settings.tokens_dir(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn public_url_override_drops_trailing_slash() {
        let mut settings = Settings::default();
        settings.server.public_url = Some("https://deck.example/".to_string());
        assert_eq!(
            settings.redirect_uri(),
            "https://deck.example/api/auth/callback"
        );
    }

    #[test]
    fn code_assist_method_url() {
        let upstream = UpstreamSettings::default();
        assert_eq!(
            upstream.code_assist_method("loadCodeAssist"),
            "https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist"
        );
    }

    #[test]
    fn default_location_follows_path_override() {
        let temp = tempfile::TempDir::new().unwrap();
        let _guard = crate::paths::TestPathGuard::new(temp.path());
        std::fs::write(temp.path().join("config.toml"), "[server]\nport = 4200\n").unwrap();

        let settings = Settings::load_default();
        assert_eq!(settings.server.port, 4200);
        assert_eq!(settings.data_dir(), temp.path());
        assert_eq!(settings.log_dir(), temp.path().join("logs"));
        assert_eq!(settings.tokens_dir(), temp.path().join("tokens"));
    }

    #[test]
    fn log_dir_follows_configured_data_dir() {
        let mut settings = Settings::default();
        settings.storage.data_dir = Some(PathBuf::from("/srv/deck"));
        assert_eq!(settings.log_dir(), PathBuf::from("/srv/deck/logs"));
    }
}
