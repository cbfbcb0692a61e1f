//! Engine configuration
//!
//! Values come from defaults, a YAML document, or `CASCADE_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the per-run admission gate for collaborator calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Runs admitted concurrently through the asynchronous submit path
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Whole-run deadline in milliseconds
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,

    /// Attempt deadline applied to steps that declare none
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,

    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_concurrent_runs: default_max_concurrent_runs(),
            run_timeout_ms: None,
            default_step_timeout_ms: None,
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn load() -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Some(value) = parse_env::<usize>("CASCADE_MAX_CONCURRENCY") {
            config.max_concurrency = value;
        }

        if let Some(value) = parse_env::<usize>("CASCADE_MAX_CONCURRENT_RUNS") {
            config.max_concurrent_runs = value;
        }

        if let Some(value) = parse_env::<u64>("CASCADE_RUN_TIMEOUT_MS") {
            config.run_timeout_ms = Some(value);
        }

        if let Some(value) = parse_env::<u64>("CASCADE_STEP_TIMEOUT_MS") {
            config.default_step_timeout_ms = Some(value);
        }

        if let Ok(level) = env::var("CASCADE_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(source: &str) -> Result<Self, CoreError> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&source)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrency == 0 {
            return Err(CoreError::ConfigurationError(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(CoreError::ConfigurationError(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whole-run deadline
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Default attempt deadline
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {} value: {}", name, raw);
            None
        }
    }
}
