//! Diagnostic payloads returned by the limiter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitInfo {
    pub rule: String,
    pub allowed: bool,
    /// Requests from this client currently in the rule's window
    pub current_requests: usize,
    pub max_requests: u64,
    pub window_seconds: u64,
    /// Seconds until the oldest record in the window expires
    pub remaining_time: f64,
    pub burst_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining: Option<u64>,
    /// Present when the request was denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

/// Per-rule view for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRuleStats {
    pub current_requests: usize,
    pub remaining_time: f64,
}

/// Violation history and window usage for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    pub client_id: String,
    pub total_violations: usize,
    pub rules: BTreeMap<String, ClientRuleStats>,
}

/// Per-rule view across all clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRuleStats {
    pub total_requests: usize,
    pub remaining_time: f64,
}

/// Snapshot of every rule's window across all clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub rules: BTreeMap<String, GlobalRuleStats>,
    pub total_clients_with_violations: usize,
    /// When the snapshot was taken (seconds since the Unix epoch)
    pub timestamp: f64,
}
