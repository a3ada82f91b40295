use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable overriding `backend.url`
pub const ENV_BACKEND_URL: &str = "AGRI_BACKEND_URL";
/// Environment variable overriding `backend.anon_key`
pub const ENV_BACKEND_ANON_KEY: &str = "AGRI_BACKEND_ANON_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the hosted backend (e.g. `https://xyz.example.co`)
    pub url: Option<String>,
    /// Public (anon) API key sent with every request
    pub anon_key: Option<String>,
    /// Per-request timeout in seconds (default: 15)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Refresh the access token in the background before it expires
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh: bool,
    /// How long before expiry a refresh is attempted, in seconds (default: 60)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    /// How often the auto-refresh task checks the session expiry, in seconds (default: 30)
    #[serde(default = "default_refresh_check_interval")]
    pub refresh_check_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            request_timeout_secs: default_request_timeout(),
            auto_refresh: default_auto_refresh(),
            refresh_margin_secs: default_refresh_margin(),
            refresh_check_interval_secs: default_refresh_check_interval(),
        }
    }
}

fn default_request_timeout() -> u64 {
    15
}

fn default_auto_refresh() -> bool {
    true
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_refresh_check_interval() -> u64 {
    30
}

impl BackendConfig {
    /// Both connection parameters, or `None` if either is missing or blank.
    pub fn connection(&self) -> Option<(&str, &str)> {
        let url = self.url.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let key = self
            .anon_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        Some((url.trim_end_matches('/'), key))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilesConfig {
    /// Row-store table holding one profile per user
    #[serde(default = "default_profiles_table")]
    pub table: String,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            table: default_profiles_table(),
        }
    }
}

fn default_profiles_table() -> String {
    "profiles".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }

    /// Override connection parameters from the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.backend.url = Some(url);
        }
        if let Some(key) = lookup(ENV_BACKEND_ANON_KEY) {
            self.backend.anon_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::from_toml("").unwrap();
        assert!(config.backend.url.is_none());
        assert_eq!(config.backend.request_timeout_secs, 15);
        assert!(config.backend.auto_refresh);
        assert_eq!(config.profiles.table, "profiles");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
[backend]
url = "https://backend.example.com/"
anon_key = "public-key"
request_timeout_secs = 5
auto_refresh = false

[profiles]
table = "grower_profiles"

[logging]
level = "debug"
"#,
        )
        .unwrap();

        assert_eq!(
            config.backend.connection(),
            Some(("https://backend.example.com", "public-key"))
        );
        assert_eq!(config.backend.request_timeout(), Duration::from_secs(5));
        assert!(!config.backend.auto_refresh);
        assert_eq!(config.profiles.table, "grower_profiles");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_connection_requires_both_parameters() {
        let mut backend = BackendConfig::default();
        assert!(backend.connection().is_none());

        backend.url = Some("https://backend.example.com".to_string());
        assert!(backend.connection().is_none());

        backend.anon_key = Some("   ".to_string());
        assert!(backend.connection().is_none(), "blank key counts as missing");

        backend.anon_key = Some("key".to_string());
        assert!(backend.connection().is_some());
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = Config::from_toml(
            r#"
[backend]
url = "https://file.example.com"
"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = [
            (ENV_BACKEND_URL, "https://env.example.com"),
            (ENV_BACKEND_ANON_KEY, "env-key"),
        ]
        .into_iter()
        .collect();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.backend.connection(),
            Some(("https://env.example.com", "env-key"))
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.profiles.table, "profiles");
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agri-session.toml");
        std::fs::write(&path, "[backend\nurl = ").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
