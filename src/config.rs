//! Configuration management for Tradegate.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TradegateError};

/// Environment variable prefix, e.g. `TRADEGATE_LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "TRADEGATE";

/// Main configuration for Tradegate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradegateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to an additional YAML rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

impl TradegateConfig {
    /// Load configuration from defaults, an optional file, then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().set_default("logging.level", default_log_level())?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| TradegateError::Config(e.to_string()))
    }
}
