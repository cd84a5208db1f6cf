//! Error types for the Tradegate rate limiter.

use thiserror::Error;

use crate::guard::RateLimitExceeded;

/// Main error type for Tradegate operations.
#[derive(Error, Debug)]
pub enum TradegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule failed validation when it was built
    #[error("Invalid rate limit rule: {0}")]
    InvalidRule(String),

    /// A guarded call was rejected
    #[error(transparent)]
    RateLimited(Box<RateLimitExceeded>),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RateLimitExceeded> for TradegateError {
    fn from(err: RateLimitExceeded) -> Self {
        TradegateError::RateLimited(Box::new(err))
    }
}

impl From<config::ConfigError> for TradegateError {
    fn from(err: config::ConfigError) -> Self {
        TradegateError::Config(err.to_string())
    }
}

/// Result type alias for Tradegate operations.
pub type Result<T> = std::result::Result<T, TradegateError>;
