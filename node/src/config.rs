//! Configuration management for the Flynn node
//!
//! Supports JSON config files and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{Backoff, SessionSettings};

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket endpoint
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Heartbeat and accrual timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Where session state and account data live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Authentication API
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base WebSocket URL (ws:// or wss://)
    #[serde(default = "default_endpoint_url")]
    pub url: String,

    /// Client version sent in the query string
    #[serde(default = "default_client_version")]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_accrual_interval")]
    pub accrual_interval_secs: u64,

    /// Chance per accrual tick of a small random bonus (0 disables)
    #[serde(default = "default_bonus_probability")]
    pub bonus_probability: f64,

    /// How often `run` prints the status panel (0 disables)
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive losses tolerated before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_step_delay")]
    pub step_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory (default: ~/.flynn)
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the auth/profile API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Public API key sent as the `apikey` header
    #[serde(default)]
    pub api_key: String,

    /// Refresh-login period while running (0 disables)
    #[serde(default = "default_auto_login_interval")]
    pub auto_login_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Disable colored output
    #[serde(default)]
    pub no_color: bool,

    /// Quiet mode
    #[serde(default)]
    pub quiet: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            version: default_client_version(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            accrual_interval_secs: default_accrual_interval(),
            bonus_probability: default_bonus_probability(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            step_delay_secs: default_step_delay(),
            max_delay_secs: default_max_delay(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            auto_login_interval_secs: default_auto_login_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            no_color: false,
            quiet: false,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config = serde_json::from_str(&content)
            .context("Failed to parse config JSON")?;

        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path.as_ref(), json)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> Result<PathBuf> {
        Ok(default_data_dir()?.join("node-config.json"))
    }

    /// Write a default config to `path` (or the default location). An
    /// existing file is only replaced with `force`.
    pub fn write_default(path: Option<&Path>, force: bool) -> Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        if path.exists() && !force {
            anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
        }
        Self::default().save(&path)?;
        Ok(path)
    }

    /// Explicit path if given, otherwise the default location when it exists,
    /// otherwise built-in defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// `FLYNN_WS_URL`, `FLYNN_API_URL`, `FLYNN_API_KEY`, `FLYNN_DATA_DIR`
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        let lookup = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup("FLYNN_WS_URL") {
            self.endpoint.url = url;
        }
        if let Some(url) = lookup("FLYNN_API_URL") {
            self.auth.api_url = url;
        }
        if let Some(key) = lookup("FLYNN_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(dir) = lookup("FLYNN_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Level used when no `--debug`/`--quiet` flag is given
    pub fn log_level(&self) -> Result<log::LevelFilter> {
        if self.logging.quiet {
            return Ok(log::LevelFilter::Warn);
        }
        self.logging
            .level
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown log level '{}'", self.logging.level))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.log_level()?;

        let url = self.endpoint.url.trim();
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            anyhow::bail!("Endpoint URL must start with 'wss://' or 'ws://'");
        }

        if self.endpoint.version.trim().is_empty() {
            anyhow::bail!("Client version must not be empty");
        }

        if self.session.ping_interval_secs == 0 || self.session.accrual_interval_secs == 0 {
            anyhow::bail!("Ping and accrual intervals must be at least 1 second");
        }

        if !(0.0..=1.0).contains(&self.session.bonus_probability) {
            anyhow::bail!("Bonus probability must be between 0 and 1");
        }

        if self.reconnect.connect_timeout_secs == 0 {
            anyhow::bail!("Connect timeout must be at least 1 second");
        }

        if self.reconnect.max_delay_secs < self.reconnect.base_delay_secs {
            anyhow::bail!("Maximum reconnect delay must not be below the base delay");
        }

        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("state.json"))
    }

    pub fn account_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("account.json"))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            endpoint: self.endpoint.url.trim().to_string(),
            version: self.endpoint.version.clone(),
            ping_interval: Duration::from_secs(self.session.ping_interval_secs),
            accrual_interval: Duration::from_secs(self.session.accrual_interval_secs),
            bonus_probability: self.session.bonus_probability,
            connect_timeout: Duration::from_secs(self.reconnect.connect_timeout_secs),
            backoff: Backoff {
                base: Duration::from_secs(self.reconnect.base_delay_secs),
                step: Duration::from_secs(self.reconnect.step_delay_secs),
                cap: Duration::from_secs(self.reconnect.max_delay_secs),
            },
            max_attempts: self.reconnect.max_attempts,
        }
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .context("Could not determine home directory")?;
    Ok(home.join(".flynn"))
}

// Default value functions
fn default_endpoint_url() -> String {
    "wss://secure.ws.teneo.pro".to_string()
}

fn default_client_version() -> String {
    "v0.2".to_string()
}

fn default_ping_interval() -> u64 {
    10
}

fn default_accrual_interval() -> u64 {
    1
}

fn default_bonus_probability() -> f64 {
    crate::session::accrual::DEFAULT_BONUS_PROBABILITY
}

fn default_status_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    5
}

fn default_step_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_api_url() -> String {
    "https://node-community-api.teneo.pro".to_string()
}

fn default_auto_login_interval() -> u64 {
    1800
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint.version, "v0.2");
        assert_eq!(config.session.ping_interval_secs, 10);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_match_session_settings() {
        let settings = Config::default().session_settings();
        let expected = SessionSettings::default();
        assert_eq!(settings.endpoint, expected.endpoint);
        assert_eq!(settings.ping_interval, expected.ping_interval);
        assert_eq!(settings.accrual_interval, expected.accrual_interval);
        assert_eq!(settings.connect_timeout, expected.connect_timeout);
        assert_eq!(settings.backoff, expected.backoff);
        assert_eq!(settings.max_attempts, expected.max_attempts);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node-config.json");
        fs::write(&path, r#"{ "reconnect": { "max_attempts": 9 } }"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.reconnect.max_attempts, 9);
        assert_eq!(config.reconnect.max_delay_secs, 300);
        assert_eq!(config.endpoint.url, "wss://secure.ws.teneo.pro");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/node-config.json");
        let mut config = Config::default();
        config.session.status_interval_secs = 0;
        config.save(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded.session.status_interval_secs, 0);
    }

    #[test]
    fn test_write_default_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flynn/node-config.json");

        let written = Config::write_default(Some(&path), false).unwrap();
        assert_eq!(written, path);
        assert_eq!(Config::from_file(&path).unwrap().endpoint.version, "v0.2");

        assert!(Config::write_default(Some(&path), false).is_err());
        fs::write(&path, "{}").unwrap();
        Config::write_default(Some(&path), true).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("ping_interval_secs"));
    }

    #[test]
    fn test_log_level_from_config() {
        let mut config = Config::default();
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Info);

        config.logging.level = "DEBUG".to_string();
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Debug);

        config.logging.quiet = true;
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Warn);

        config.logging.quiet = false;
        config.logging.level = "loud".to_string();
        assert!(config.log_level().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLYNN_WS_URL", "ws://127.0.0.1:9000"),
            ("FLYNN_API_KEY", "anon-key"),
            ("FLYNN_DATA_DIR", "/tmp/flynn-test"),
            ("FLYNN_API_URL", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.endpoint.url, "ws://127.0.0.1:9000");
        assert_eq!(config.auth.api_key, "anon-key");
        assert_eq!(config.auth.api_url, "https://node-community-api.teneo.pro");
        assert_eq!(config.state_path().unwrap(), PathBuf::from("/tmp/flynn-test/state.json"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.endpoint.url = "https://secure.ws.teneo.pro".to_string();
        assert!(config.validate().is_err());

        config.endpoint.url = "ws://localhost:8080".to_string();
        assert!(config.validate().is_ok());

        config.session.ping_interval_secs = 0;
        assert!(config.validate().is_err());
        config.session.ping_interval_secs = 10;

        config.session.bonus_probability = 1.5;
        assert!(config.validate().is_err());
        config.session.bonus_probability = 0.0;

        config.reconnect.max_delay_secs = 1;
        assert!(config.validate().is_err());
    }
}
