//! Runtime configuration
//!
//! Settings are read from an optional TOML file and then overridden by
//! environment variables, so the host app and the CLI can share one file.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Default remote prediction service
pub const DEFAULT_PREDICTION_URL: &str = "https://stress-api-265312655492.asia-southeast2.run.app";

/// Default per-query timeout for health data reads
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default timeout for the prediction request
pub const DEFAULT_PREDICTION_TIMEOUT_SECS: u64 = 30;

/// Default name of the preference file
pub const DEFAULT_STORE_FILE: &str = "user_preferences.json";

pub const ENV_PREDICTION_URL: &str = "WELLNESS_PREDICTION_URL";
pub const ENV_FETCH_TIMEOUT: &str = "WELLNESS_FETCH_TIMEOUT_SECS";
pub const ENV_STORE_PATH: &str = "WELLNESS_STORE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub prediction_base_url: String,
    pub fetch_timeout_secs: u64,
    pub prediction_timeout_secs: u64,
    pub store_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prediction_base_url: DEFAULT_PREDICTION_URL.to_string(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            prediction_timeout_secs: DEFAULT_PREDICTION_TIMEOUT_SECS,
            store_path: PathBuf::from(DEFAULT_STORE_FILE),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `path` if given, then apply environment overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            Some(p) => {
                tracing::debug!("Config file {:?} not found, using defaults", p);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_PREDICTION_URL) {
            self.prediction_base_url = url;
        }
        if let Some(raw) = lookup(ENV_FETCH_TIMEOUT) {
            self.fetch_timeout_secs = raw.trim().parse().map_err(|_| {
                SyncError::Config(format!("{} must be a whole number of seconds", ENV_FETCH_TIMEOUT))
            })?;
        }
        if let Some(path) = lookup(ENV_STORE_PATH) {
            self.store_path = PathBuf::from(path);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.fetch_timeout_secs == 0 {
            return Err(SyncError::Config("fetch_timeout_secs must be positive".to_string()));
        }
        if !(self.prediction_base_url.starts_with("http://")
            || self.prediction_base_url.starts_with("https://"))
        {
            return Err(SyncError::Config(format!(
                "prediction_base_url must be an http(s) URL, got '{}'",
                self.prediction_base_url
            )));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn prediction_timeout(&self) -> Duration {
        Duration::from_secs(self.prediction_timeout_secs)
    }
}
