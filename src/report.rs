//! Error reporting hooks.
//!
//! The dashboard's error-handling layer decides what to do with a rejected
//! call; this module gives it a severity and a structured context to work with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

/// How serious a reported error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Something that can receive typed errors with structured context.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, severity: Severity, message: &str, context: &Value);
}

/// Reports errors as tracing events at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, severity: Severity, message: &str, context: &Value) {
        match severity {
            Severity::Info => info!(context = %context, "{}", message),
            Severity::Warning => warn!(context = %context, "{}", message),
            Severity::Error => error!(context = %context, "{}", message),
        }
    }
}
