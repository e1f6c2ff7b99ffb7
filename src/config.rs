//! Daemon configuration

use crate::enforcement::{DEFAULT_MAX_CONCURRENCY, EnforcementError, EnforcementResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";
/// Config file used when the environment does not name one
pub const DEFAULT_CONFIG_PATH: &str = "config/warden.yaml";

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(crate::logging::LOG_DIR)
}

fn default_api_base_url() -> String {
    "https://plex.tv".to_string()
}

const fn default_tick_interval() -> u64 {
    60
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// Settings read once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory shared with the dashboards (rules, users, state files)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Base URL of the remote account API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Seconds between enforcement ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Timeout for a single remote call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Users reconciled in parallel within a tick
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            api_base_url: default_api_base_url(),
            tick_interval_secs: default_tick_interval(),
            request_timeout_secs: default_request_timeout(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl DaemonConfig {
    /// Load from the file named by `WARDEN_CONFIG`, or the default path
    ///
    /// # Errors
    /// Returns an error if the file exists but is invalid
    pub async fn load() -> EnforcementResult<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path).await
    }

    /// Load from `path`; a missing file yields the defaults
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated
    pub async fn load_from(path: impl AsRef<Path>) -> EnforcementResult<Self> {
        let config = match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(content) if content.trim().is_empty() => Self::default(),
            Ok(content) => serde_yaml::from_str(&content)
                .map_err(|e| EnforcementError::Config(format!("{}: {e}", path.as_ref().display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with
    ///
    /// # Errors
    /// Returns a configuration error naming the offending field
    pub fn validate(&self) -> EnforcementResult<()> {
        if self.tick_interval_secs == 0 {
            return Err(EnforcementError::Config(
                "tick_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(EnforcementError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EnforcementError::Config(
                "max_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn applied_restrictions_path(&self) -> PathBuf {
        self.data_dir.join("applied_restrictions.yaml")
    }

    #[must_use]
    pub fn bypasses_path(&self) -> PathBuf {
        self.data_dir.join("bypasses.yaml")
    }

    #[must_use]
    pub fn activity_path(&self) -> PathBuf {
        self.data_dir.join("activity.yaml")
    }
}
