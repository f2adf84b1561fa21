//! Agent configuration loaded from YAML.

pub mod scrape;

pub use scrape::{
    GcplogConfig, JournalConfig, PushConfig, ScrapeConfig, StaticConfig, SyslogConfig,
};

use crate::{LogshipError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_POSITIONS_FILE: &str = "/tmp/positions.yaml";
const DEFAULT_SYNC_PERIOD_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub positions: PositionsConfig,

    #[serde(default)]
    pub target_config: TargetConfig,

    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());

        let raw = std::fs::read_to_string(path).map_err(|e| {
            LogshipError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Structural checks only; backend selection happens during classification.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for cfg in &self.scrape_configs {
            if cfg.job_name.trim().is_empty() {
                return Err(LogshipError::ConfigError(
                    "scrape config is missing job_name".to_string(),
                ));
            }
            if !seen.insert(cfg.job_name.as_str()) {
                return Err(LogshipError::ConfigError(format!(
                    "found multiple scrape configs with job name {:?}",
                    cfg.job_name
                )));
            }
        }

        if self.positions.sync_period_secs == 0 {
            return Err(LogshipError::ConfigError(
                "positions.sync_period_secs must be greater than zero".to_string(),
            ));
        }
        if self.target_config.poll_interval_ms == 0 {
            return Err(LogshipError::ConfigError(
                "target_config.poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Where and how often read offsets are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    pub filename: PathBuf,
    pub sync_period_secs: u64,
    pub ignore_invalid_yaml: bool,
}

impl PositionsConfig {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from(DEFAULT_POSITIONS_FILE),
            sync_period_secs: DEFAULT_SYNC_PERIOD_SECS,
            ignore_invalid_yaml: false,
        }
    }
}

/// Settings consumed by the file backend, plus the single-stream switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// How often tailers check their files for new data.
    pub poll_interval_ms: u64,

    /// Read standard input instead of discovering targets.
    pub stdin: bool,
}

impl TargetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stdin: false,
        }
    }
}
