//! Configuration loader and validator for the retail sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::Session;
use crate::scheduler::SchedulerSettings;
use crate::sync::EngineSettings;

pub const ENV_REMOTE_URL: &str = "SUPABASE_URL";
pub const ENV_REMOTE_KEY: &str = "SUPABASE_ANON_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Missing required setting {0}")]
    Missing(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub remote: Remote,
    pub session: SessionConfig,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub data_dir: String,
    pub sync_interval_secs: u64,
    pub reconnect_debounce_ms: u64,
    pub probe_interval_secs: u64,
    pub max_attempts: i64,
    pub synced_retention_hours: u64,
    pub request_timeout_secs: u64,
}

impl Default for App {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            sync_interval_secs: 30,
            reconnect_debounce_ms: 2000,
            probe_interval_secs: 10,
            max_attempts: 5,
            synced_retention_hours: 24,
            request_timeout_secs: 15,
        }
    }
}

/// Remote store connection. Both values may come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Remote {
    pub url: String,
    pub api_key: String,
}

/// Who this device acts as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub store_id: i64,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}/retail-sync.db", self.app.data_dir.trim_end_matches('/'))
    }

    pub fn session(&self) -> Session {
        let session = Session::new(self.session.store_id, self.session.user_id.clone());
        match &self.session.email {
            Some(email) => session.with_email(email.clone()),
            None => session,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_attempts: self.app.max_attempts,
            retention: Duration::from_secs(self.app.synced_retention_hours * 3600),
            item_timeout: Duration::from_secs(self.app.request_timeout_secs * 2),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_secs(self.app.sync_interval_secs),
            reconnect_debounce: Duration::from_millis(self.app.reconnect_debounce_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.app.request_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.app.probe_interval_secs)
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    from_yaml(&content, |key| std::env::var(key).ok())
}

/// Parse, overlay `SUPABASE_URL` / `SUPABASE_ANON_KEY` from `env`, validate.
pub fn from_yaml(content: &str, env: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    let mut cfg: Config = serde_yaml::from_str(content)?;
    if let Some(url) = env(ENV_REMOTE_URL).filter(|v| !v.trim().is_empty()) {
        cfg.remote.url = url;
    }
    if let Some(key) = env(ENV_REMOTE_KEY).filter(|v| !v.trim().is_empty()) {
        cfg.remote.api_key = key;
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.remote.url.trim().is_empty() {
        return Err(ConfigError::Missing(ENV_REMOTE_URL));
    }
    if cfg.remote.api_key.trim().is_empty() {
        return Err(ConfigError::Missing(ENV_REMOTE_KEY));
    }
    if !cfg.remote.url.starts_with("http://") && !cfg.remote.url.starts_with("https://") {
        return Err(ConfigError::Invalid("remote.url must be an http(s) url"));
    }

    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_secs must be > 0"));
    }
    if cfg.app.probe_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.probe_interval_secs must be > 0"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }
    if cfg.app.max_attempts < 1 {
        return Err(ConfigError::Invalid("app.max_attempts must be >= 1"));
    }

    if cfg.session.store_id <= 0 {
        return Err(ConfigError::Invalid("session.store_id must be > 0"));
    }
    if cfg.session.user_id.trim().is_empty() {
        return Err(ConfigError::Invalid("session.user_id must be non-empty"));
    }
    Ok(())
}

/// Example configuration; connection values are usually supplied by the environment.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_secs: 30
  reconnect_debounce_ms: 2000
  probe_interval_secs: 10
  max_attempts: 5
  synced_retention_hours: 24
  request_timeout_secs: 15

remote:
  url: "https://YOUR_PROJECT.supabase.co"
  api_key: "YOUR_SUPABASE_ANON_KEY"

session:
  store_id: 1
  user_id: "00000000-0000-0000-0000-000000000000"
  email: "owner@example.com"
"#
}
