use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::DEFAULT_TOPIC;
use crate::record::TableSpec;
use crate::validator::{ScanMode, ValidatorConfig};
use crate::{AppError, AppResult};

pub const BASE_URL_ENV: &str = "DUALMIGRATE_BASE_URL";
pub const TARGET_URL_ENV: &str = "DUALMIGRATE_TARGET_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModeName {
    #[default]
    Full,
    Incremental,
}

fn default_topic() -> String {
    DEFAULT_TOPIC.into()
}
fn default_batch_size() -> usize {
    100
}
fn default_op_timeout_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_poll_interval_ms() -> u64 {
    500
}

/// Settings for the `dualmigrate` binary, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratorConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub target_url: String,
    /// Database holding the event channel. Defaults to the base database.
    #[serde(default)]
    pub channel_url: Option<String>,
    pub table: TableSpec,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub mode: ModeName,
    #[serde(default)]
    pub since_ms: i64,
    #[serde(default)]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl MigratorConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::from(err).with_context("path", path.display().to_string())
        })?;
        let mut config: MigratorConfig = serde_json::from_str(&raw).map_err(|err| {
            AppError::from(err).with_context("path", path.display().to_string())
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            self.base_url = url;
        }
        if let Ok(url) = std::env::var(TARGET_URL_ENV) {
            self.target_url = url;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.base_url.is_empty() || self.target_url.is_empty() {
            return Err(AppError::new(
                "CONFIG/MISSING_URL",
                "both base_url and target_url are required",
            ));
        }
        if self.batch_size == 0 {
            return Err(AppError::new("CONFIG/BATCH_SIZE", "batch_size must be positive"));
        }
        if self.topic.is_empty() {
            return Err(AppError::new("CONFIG/TOPIC", "topic must not be empty"));
        }
        self.table.validate()
    }

    pub fn channel_url(&self) -> &str {
        self.channel_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        let mode = match self.mode {
            ModeName::Full => ScanMode::Full,
            ModeName::Incremental => ScanMode::Incremental {
                since_ms: self.since_ms,
            },
        };
        ValidatorConfig {
            batch_size: self.batch_size,
            mode,
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
            op_timeout: self.op_timeout(),
            ..ValidatorConfig::default()
        }
    }
}
