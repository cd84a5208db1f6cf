//! Call-site rate limiting.
//!
//! `RateLimitGuard` sits in front of an operation: it derives a client
//! identity from the call's arguments, asks the limiter for admission, and
//! either runs the operation or returns a `RateLimitExceeded` error. There are
//! no retries and no queuing; callers honour `retry_after` themselves.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::ratelimit::{LimitInfo, RateLimiter, DEFAULT_RULE};
use crate::report::{ErrorReporter, Severity};

/// Client identity used when the arguments carry none.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Default name of the argument holding the client identity.
pub const DEFAULT_CLIENT_ID_PARAM: &str = "client_id";

/// Arguments of a guarded call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }
}

/// A guarded call was denied.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Rate limit exceeded for client '{client_id}' on rule '{rule_name}'")]
pub struct RateLimitExceeded {
    pub rule_name: String,
    pub client_id: String,
    pub limit_info: LimitInfo,
}

impl RateLimitExceeded {
    /// Denials are expected traffic, not faults.
    pub fn severity(&self) -> Severity {
        Severity::Warning
    }

    /// Structured context for the error-reporting layer.
    pub fn context(&self) -> Value {
        json!({
            "rule_name": self.rule_name,
            "client_id": self.client_id,
            "limit_info": self.limit_info,
        })
    }

    /// Hand this error to a reporter.
    pub fn report(&self, reporter: &dyn ErrorReporter) {
        reporter.report(self.severity(), &self.to_string(), &self.context());
    }
}

/// Admit/reject gate in front of an operation.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    rule_name: String,
    client_id_param: String,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl RateLimitGuard {
    /// Guard calls with the `api_general` rule, reading the identity from
    /// the `client_id` argument.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            rule_name: DEFAULT_RULE.to_string(),
            client_id_param: DEFAULT_CLIENT_ID_PARAM.to_string(),
            reporter: None,
        }
    }

    /// Use a different rule.
    pub fn rule(mut self, rule_name: impl Into<String>) -> Self {
        self.rule_name = rule_name.into();
        self
    }

    /// Read the identity from a different named argument.
    pub fn client_id_param(mut self, param: impl Into<String>) -> Self {
        self.client_id_param = param.into();
        self
    }

    /// Report every denial before returning it.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    /// Derive the client identity for a call.
    ///
    /// The named identity argument wins when it is set, then the first
    /// positional argument, then `"anonymous"`. Null and empty-string values
    /// count as unset. Other non-string values use their JSON text.
    pub fn resolve_client_id(&self, args: &CallArgs) -> String {
        let named = args.get(&self.client_id_param).filter(|v| is_set(v));
        let positional = args.positional().first().filter(|v| is_set(v));

        match named.or(positional) {
            Some(value) => stringify(value),
            None => ANONYMOUS_CLIENT.to_string(),
        }
    }

    /// Run `f` if the caller is admitted.
    pub fn call<T, F>(&self, args: &CallArgs, f: F) -> Result<T, RateLimitExceeded>
    where
        F: FnOnce(&CallArgs) -> T,
    {
        let client_id = self.resolve_client_id(args);
        let (allowed, limit_info) = self.limiter.check_limit(&self.rule_name, &client_id, None);

        if !allowed {
            let err = RateLimitExceeded {
                rule_name: self.rule_name.clone(),
                client_id,
                limit_info,
            };
            debug!(
                rule = %err.rule_name,
                client_id = %err.client_id,
                retry_after = ?err.limit_info.retry_after,
                "Guarded call rejected"
            );
            if let Some(reporter) = &self.reporter {
                err.report(reporter.as_ref());
            }
            return Err(err);
        }

        Ok(f(args))
    }

    /// Wrap an operation so that every invocation goes through the guard.
    pub fn wrap<T, F>(self, f: F) -> impl Fn(&CallArgs) -> Result<T, RateLimitExceeded>
    where
        F: Fn(&CallArgs) -> T,
    {
        move |args: &CallArgs| self.call(args, &f)
    }
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("rule_name", &self.rule_name)
            .field("client_id_param", &self.client_id_param)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

fn is_set(value: &Value) -> bool {
    !value.is_null() && value.as_str() != Some("")
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
