//! Rate limit rules and rule file loading.
//!
//! A rule is immutable once built: quota and window are validated at
//! construction so that a bad rule never reaches the check path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TradegateError};

/// Name of the rule that unknown rule names fall back to.
pub const DEFAULT_RULE: &str = "api_general";

/// A rate limit rule specifying quota, window, burst and cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitRule {
    requests_per_window: u64,
    window_seconds: u64,
    burst_limit: u64,
    cooldown_seconds: u64,
}

impl RateLimitRule {
    /// Create a rule with no cooldown and a burst limit equal to the quota.
    pub fn new(requests_per_window: u64, window_seconds: u64) -> Result<Self> {
        if requests_per_window == 0 {
            return Err(TradegateError::InvalidRule(
                "requests_per_window must be greater than zero".to_string(),
            ));
        }
        if window_seconds == 0 {
            return Err(TradegateError::InvalidRule(
                "window_seconds must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            requests_per_window,
            window_seconds,
            burst_limit: requests_per_window,
            cooldown_seconds: 0,
        })
    }

    /// Set the advisory burst ceiling reported in diagnostics.
    pub fn with_burst_limit(mut self, burst_limit: u64) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    /// Set the lockout applied after a violation. Zero disables it.
    pub fn with_cooldown(mut self, cooldown_seconds: u64) -> Self {
        self.cooldown_seconds = cooldown_seconds;
        self
    }

    pub fn requests_per_window(&self) -> u64 {
        self.requests_per_window
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Advisory only; the counter enforces `requests_per_window`.
    pub fn burst_limit(&self) -> u64 {
        self.burst_limit
    }

    pub fn cooldown_seconds(&self) -> u64 {
        self.cooldown_seconds
    }
}

/// The rules registered on every new limiter.
pub fn default_rules() -> Vec<(&'static str, RateLimitRule)> {
    // All quotas and windows here are non-zero.
    let rule = |quota, window, burst, cooldown| RateLimitRule {
        requests_per_window: quota,
        window_seconds: window,
        burst_limit: burst,
        cooldown_seconds: cooldown,
    };

    vec![
        ("api_general", rule(100, 60, 120, 0)),
        ("api_data", rule(50, 60, 60, 0)),
        ("api_trading", rule(10, 60, 12, 0)),
        ("auth_login", rule(5, 300, 3, 300)),
        ("web_general", rule(1000, 60, 1200, 0)),
    ]
}

/// One rule as written in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Number of requests admitted per window
    pub requests_per_window: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Advisory burst ceiling (defaults to the quota)
    #[serde(default)]
    pub burst_limit: Option<u64>,
    /// Lockout after a violation
    #[serde(default)]
    pub cooldown_seconds: u64,
}

impl TryFrom<&RuleConfig> for RateLimitRule {
    type Error = TradegateError;

    fn try_from(config: &RuleConfig) -> Result<Self> {
        let rule = RateLimitRule::new(config.requests_per_window, config.window_seconds)?
            .with_cooldown(config.cooldown_seconds);
        Ok(match config.burst_limit {
            Some(burst) => rule.with_burst_limit(burst),
            None => rule,
        })
    }
}

/// A set of named rules loaded from YAML.
///
/// ```yaml
/// rules:
///   api_quotes:
///     requests_per_window: 30
///     window_seconds: 10
///     burst_limit: 40
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: BTreeMap<String, RuleConfig>,
}

impl RulesFile {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate every rule, failing on the first bad one.
    pub fn build(&self) -> Result<Vec<(String, RateLimitRule)>> {
        self.rules
            .iter()
            .map(|(name, config)| {
                RateLimitRule::try_from(config)
                    .map(|rule| (name.clone(), rule))
                    .map_err(|e| match e {
                        TradegateError::InvalidRule(msg) => {
                            TradegateError::InvalidRule(format!("{}: {}", name, msg))
                        }
                        other => other,
                    })
            })
            .collect()
    }
}
