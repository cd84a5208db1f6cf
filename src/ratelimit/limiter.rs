//! Core rate limiter implementation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::SlidingWindowCounter;
use super::rules::{default_rules, RateLimitRule, RulesFile, DEFAULT_RULE};
use super::stats::{ClientRuleStats, ClientStats, GlobalRuleStats, GlobalStats, LimitInfo};
use crate::error::Result;

/// Number of violation timestamps kept per client.
const MAX_VIOLATIONS_PER_CLIENT: usize = 10;

/// A registered rule together with its window.
#[derive(Clone)]
struct RuleEntry {
    rule: RateLimitRule,
    counter: Arc<SlidingWindowCounter>,
}

#[derive(Default)]
struct LimiterState {
    rules: HashMap<String, RuleEntry>,
    /// Recent violation timestamps per client, oldest first
    client_violations: HashMap<String, VecDeque<f64>>,
}

/// The rate limiter that routes checks to per-rule sliding windows.
///
/// This struct is thread-safe and is meant to be created once by the
/// application and shared behind an `Arc`. Window accounting happens under
/// each counter's own lock; rule registration and violation history share a
/// single limiter lock that is never held while a counter is updated.
pub struct RateLimiter {
    state: RwLock<LimiterState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter on the wall clock with the default rules.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new rate limiter on the given clock with the default rules.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let limiter = Self {
            state: RwLock::new(LimiterState::default()),
            clock,
        };
        for (name, rule) in default_rules() {
            limiter.add_rule(name, rule);
        }
        limiter
    }

    /// Register a rule, replacing any rule of the same name and its window.
    pub fn add_rule(&self, name: impl Into<String>, rule: RateLimitRule) {
        let name = name.into();
        let counter = Arc::new(SlidingWindowCounter::new(
            rule.requests_per_window(),
            rule.window_seconds(),
            self.clock.clone(),
        ));

        debug!(
            rule = %name,
            requests_per_window = rule.requests_per_window(),
            window_seconds = rule.window_seconds(),
            burst_limit = rule.burst_limit(),
            cooldown_seconds = rule.cooldown_seconds(),
            "Registering rate limit rule"
        );

        let mut state = self.state.write();
        if state.rules.insert(name.clone(), RuleEntry { rule, counter }).is_some() {
            debug!(rule = %name, "Replaced existing rule, window state discarded");
        }
    }

    /// Register every rule in a rules file. Nothing is registered if any rule
    /// is invalid.
    pub fn load_rules(&self, file: &RulesFile) -> Result<usize> {
        let rules = file.build()?;
        let count = rules.len();
        for (name, rule) in rules {
            self.add_rule(name, rule);
        }
        Ok(count)
    }

    /// Check whether `client_id` may make another request under `rule_name`.
    ///
    /// Unknown rule names are checked against `api_general`. Never fails.
    pub fn check_limit(
        &self,
        rule_name: &str,
        client_id: &str,
        endpoint: Option<&str>,
    ) -> (bool, LimitInfo) {
        let Some((name, entry)) = self.resolve(rule_name) else {
            warn!(rule = %rule_name, "No rule and no fallback rule registered, allowing request");
            return (true, Self::unlimited_info(rule_name));
        };

        trace!(
            rule = %name,
            client_id = %client_id,
            endpoint = endpoint.unwrap_or(""),
            "Checking rate limit"
        );

        if self.is_in_cooldown(client_id, &entry.rule) {
            debug!(
                rule = %name,
                client_id = %client_id,
                "Client in cooldown"
            );
            let cooldown = entry.rule.cooldown_seconds();
            return (false, Self::limit_info(&name, &entry, client_id, false, cooldown));
        }

        let allowed = entry.counter.add_request(client_id);
        if !allowed {
            self.record_violation(client_id);
            debug!(
                rule = %name,
                client_id = %client_id,
                endpoint = endpoint.unwrap_or(""),
                "Rate limit exceeded"
            );
        }

        (allowed, Self::limit_info(&name, &entry, client_id, allowed, 0))
    }

    /// Whether the client's most recent violation is within the rule's cooldown.
    ///
    /// Violation history is kept per client, not per rule.
    pub fn is_in_cooldown(&self, client_id: &str, rule: &RateLimitRule) -> bool {
        let cooldown = rule.cooldown_seconds();
        if cooldown == 0 {
            return false;
        }

        let state = self.state.read();
        let last_violation = state
            .client_violations
            .get(client_id)
            .and_then(|v| v.iter().copied().reduce(f64::max));

        match last_violation {
            Some(last) => self.clock.now() - last < cooldown as f64,
            None => false,
        }
    }

    /// Assemble the diagnostic payload for a rule and client.
    ///
    /// Returns `None` for an unknown rule name.
    pub fn build_limit_info(
        &self,
        rule_name: &str,
        client_id: &str,
        allowed: bool,
        cooldown_remaining: u64,
    ) -> Option<LimitInfo> {
        let entry = self.state.read().rules.get(rule_name).cloned()?;
        Some(Self::limit_info(
            rule_name,
            &entry,
            client_id,
            allowed,
            cooldown_remaining,
        ))
    }

    /// Violation count and per-rule window usage for one client.
    pub fn get_client_stats(&self, client_id: &str) -> ClientStats {
        let (entries, total_violations) = {
            let state = self.state.read();
            let violations = state
                .client_violations
                .get(client_id)
                .map_or(0, VecDeque::len);
            (Self::snapshot(&state), violations)
        };

        let rules = entries
            .into_iter()
            .map(|(name, entry)| {
                let stats = ClientRuleStats {
                    current_requests: entry.counter.get_request_count(Some(client_id)),
                    remaining_time: entry.counter.get_remaining_time(),
                };
                (name, stats)
            })
            .collect();

        ClientStats {
            client_id: client_id.to_string(),
            total_violations,
            rules,
        }
    }

    /// Clear a client's violation history.
    ///
    /// Requests already counted in the shared windows are not removed; they
    /// expire with the window.
    pub fn reset_client(&self, client_id: &str) {
        let removed = self.state.write().client_violations.remove(client_id);
        debug!(
            client_id = %client_id,
            violations = removed.map_or(0, |v| v.len()),
            "Reset client violation history"
        );
    }

    /// Window usage for every rule across all clients.
    pub fn get_global_stats(&self) -> GlobalStats {
        let (entries, total_clients_with_violations) = {
            let state = self.state.read();
            (Self::snapshot(&state), state.client_violations.len())
        };

        let rules = entries
            .into_iter()
            .map(|(name, entry)| {
                let stats = GlobalRuleStats {
                    total_requests: entry.counter.get_request_count(None),
                    remaining_time: entry.counter.get_remaining_time(),
                };
                (name, stats)
            })
            .collect();

        GlobalStats {
            rules,
            total_clients_with_violations,
            timestamp: self.clock.now(),
        }
    }

    /// Get a registered rule by name.
    pub fn rule(&self, name: &str) -> Option<RateLimitRule> {
        self.state.read().rules.get(name).map(|e| e.rule.clone())
    }

    /// Names of all registered rules, sorted.
    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().rules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Find the rule entry for a name, falling back to the default rule.
    fn resolve(&self, rule_name: &str) -> Option<(String, RuleEntry)> {
        let state = self.state.read();
        if let Some(entry) = state.rules.get(rule_name) {
            return Some((rule_name.to_string(), entry.clone()));
        }

        debug!(rule = %rule_name, fallback = DEFAULT_RULE, "Unknown rule, using fallback");
        state
            .rules
            .get(DEFAULT_RULE)
            .map(|entry| (DEFAULT_RULE.to_string(), entry.clone()))
    }

    fn record_violation(&self, client_id: &str) {
        let now = self.clock.now();
        let mut state = self.state.write();
        let violations = state
            .client_violations
            .entry(client_id.to_string())
            .or_default();

        violations.push_back(now);
        while violations.len() > MAX_VIOLATIONS_PER_CLIENT {
            violations.pop_front();
        }
    }

    /// Copy out rule entries so counters can be read without the limiter lock.
    fn snapshot(state: &LimiterState) -> BTreeMap<String, RuleEntry> {
        state
            .rules
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    fn limit_info(
        name: &str,
        entry: &RuleEntry,
        client_id: &str,
        allowed: bool,
        cooldown_remaining: u64,
    ) -> LimitInfo {
        let counter = &entry.counter;
        let current_requests = counter.get_request_count(Some(client_id));
        let remaining_time = counter.get_remaining_time();

        LimitInfo {
            rule: name.to_string(),
            allowed,
            current_requests,
            max_requests: entry.rule.requests_per_window(),
            window_seconds: entry.rule.window_seconds(),
            remaining_time,
            burst_limit: entry.rule.burst_limit(),
            cooldown_remaining: (cooldown_remaining > 0).then_some(cooldown_remaining),
            retry_after: (!allowed).then_some(remaining_time),
        }
    }

    fn unlimited_info(rule_name: &str) -> LimitInfo {
        LimitInfo {
            rule: rule_name.to_string(),
            allowed: true,
            current_requests: 0,
            max_requests: 0,
            window_seconds: 0,
            remaining_time: 0.0,
            burst_limit: 0,
            cooldown_remaining: None,
            retry_after: None,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000.0));
        (RateLimiter::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_rate_limiter_creation() {
        let (limiter, _clock) = limiter();
        assert_eq!(
            limiter.rule_names(),
            vec!["api_data", "api_general", "api_trading", "auth_login", "web_general"]
        );
    }

    #[test]
    fn test_quota_then_recovery_after_window() {
        let (limiter, clock) = limiter();
        limiter.add_rule("tight", RateLimitRule::new(2, 10).unwrap());

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(limiter.check_limit("tight", "a", None).0);
            clock.advance(Duration::from_millis(250));
        }
        assert_eq!(results, vec![true, true, false]);
        assert_eq!(limiter.get_client_stats("a").total_violations, 1);

        clock.advance(Duration::from_secs(10));
        let (allowed, _) = limiter.check_limit("tight", "a", None);
        assert!(allowed);
    }

    #[test]
    fn test_cooldown_overrides_window_capacity() {
        let (limiter, clock) = limiter();
        limiter.add_rule("login", RateLimitRule::new(1, 5).unwrap().with_cooldown(20));

        assert!(limiter.check_limit("login", "b", None).0);

        let (allowed, info) = limiter.check_limit("login", "b", None);
        assert!(!allowed);
        assert!(info.retry_after.is_some());

        clock.advance(Duration::from_secs(2));
        let (allowed, info) = limiter.check_limit("login", "b", None);
        assert!(!allowed);
        assert_eq!(info.cooldown_remaining, Some(20));

        // Window has room again long before the cooldown ends
        clock.advance(Duration::from_secs(10));
        let (allowed, info) = limiter.check_limit("login", "b", None);
        assert!(!allowed);
        assert_eq!(info.cooldown_remaining, Some(20));

        clock.advance(Duration::from_secs(9));
        let (allowed, info) = limiter.check_limit("login", "b", None);
        assert!(allowed);
        assert_eq!(info.cooldown_remaining, None);
    }

    #[test]
    fn test_cooldown_limit_info_reports_live_window() {
        let (limiter, clock) = limiter();
        limiter.add_rule("login", RateLimitRule::new(2, 10).unwrap().with_cooldown(60));

        assert!(limiter.check_limit("login", "a", None).0);
        clock.advance(Duration::from_secs(5));
        assert!(limiter.check_limit("login", "a", None).0);
        assert!(!limiter.check_limit("login", "a", None).0);

        // First record expired, second has 3s left, client still cooling down
        clock.advance(Duration::from_secs(7));
        let (allowed, info) = limiter.check_limit("login", "a", None);
        assert!(!allowed);
        assert_eq!(info.cooldown_remaining, Some(60));
        assert_eq!(info.current_requests, 1);
        assert_eq!(info.remaining_time, 3.0);
        assert_eq!(info.retry_after, Some(3.0));
        assert_eq!(limiter.get_global_stats().rules["login"].remaining_time, 3.0);
    }

    #[test]
    fn test_cooldown_checks_do_not_drain_window() {
        let (limiter, _clock) = limiter();
        limiter.add_rule("login", RateLimitRule::new(2, 60).unwrap().with_cooldown(30));

        assert!(limiter.check_limit("login", "a", None).0);
        assert!(limiter.check_limit("login", "a", None).0);
        assert!(!limiter.check_limit("login", "a", None).0);

        for _ in 0..5 {
            assert!(!limiter.check_limit("login", "a", None).0);
        }

        // Cooldown denials are not violations and not window entries
        assert_eq!(limiter.get_client_stats("a").total_violations, 1);
        assert_eq!(limiter.get_global_stats().rules["login"].total_requests, 2);
    }

    #[test]
    fn test_zero_cooldown_never_locks_out() {
        let (limiter, _clock) = limiter();
        let rule = RateLimitRule::new(1, 60).unwrap();

        limiter.add_rule("plain", rule.clone());
        limiter.check_limit("plain", "a", None);
        limiter.check_limit("plain", "a", None);

        assert!(!limiter.is_in_cooldown("a", &rule));
    }

    #[test]
    fn test_violation_history_is_capped() {
        let (limiter, _clock) = limiter();
        limiter.add_rule("one", RateLimitRule::new(1, 60).unwrap());

        for _ in 0..25 {
            limiter.check_limit("one", "a", None);
        }

        assert_eq!(limiter.get_client_stats("a").total_violations, 10);
    }

    #[test]
    fn test_unknown_rule_falls_back_to_default() {
        let (limiter, _clock) = limiter();

        let (allowed, info) = limiter.check_limit("does-not-exist", "c1", None);
        assert!(allowed);
        assert_eq!(info.rule, DEFAULT_RULE);
        assert_eq!(info.max_requests, 100);
        assert_eq!(info.burst_limit, 120);

        let (allowed, info) = limiter.check_limit(DEFAULT_RULE, "c1", None);
        assert!(allowed);
        assert_eq!(info.current_requests, 2);
    }

    #[test]
    fn test_shared_budget_across_clients() {
        let (limiter, _clock) = limiter();
        limiter.add_rule("shared", RateLimitRule::new(3, 60).unwrap());

        assert!(limiter.check_limit("shared", "a", None).0);
        assert!(limiter.check_limit("shared", "b", None).0);
        assert!(limiter.check_limit("shared", "c", None).0);

        let (allowed, info) = limiter.check_limit("shared", "d", None);
        assert!(!allowed);
        assert_eq!(info.current_requests, 0);
        assert_eq!(limiter.get_client_stats("d").total_violations, 1);
    }

    #[test]
    fn test_limit_info_fields() {
        let (limiter, clock) = limiter();
        limiter.add_rule(
            "data",
            RateLimitRule::new(2, 60).unwrap().with_burst_limit(4),
        );

        let (_, info) = limiter.check_limit("data", "a", Some("/quotes"));
        assert!(info.allowed);
        assert_eq!(info.current_requests, 1);
        assert_eq!(info.max_requests, 2);
        assert_eq!(info.window_seconds, 60);
        assert_eq!(info.burst_limit, 4);
        assert_eq!(info.remaining_time, 60.0);
        assert_eq!(info.retry_after, None);

        clock.advance(Duration::from_secs(15));
        limiter.check_limit("data", "a", None);
        let (allowed, info) = limiter.check_limit("data", "a", None);
        assert!(!allowed);
        assert_eq!(info.retry_after, Some(45.0));
        assert_eq!(info.cooldown_remaining, None);
    }

    #[test]
    fn test_build_limit_info_for_unknown_rule() {
        let (limiter, _clock) = limiter();
        assert!(limiter.build_limit_info("nope", "a", true, 0).is_none());

        let info = limiter.build_limit_info("auth_login", "a", false, 300).unwrap();
        assert_eq!(info.cooldown_remaining, Some(300));
        assert_eq!(info.retry_after, Some(0.0));
    }

    #[test]
    fn test_reset_client_keeps_window() {
        let (limiter, _clock) = limiter();
        limiter.add_rule("one", RateLimitRule::new(1, 60).unwrap());

        limiter.check_limit("one", "a", None);
        limiter.check_limit("one", "a", None);
        assert_eq!(limiter.get_client_stats("a").total_violations, 1);
        assert_eq!(limiter.get_global_stats().total_clients_with_violations, 1);

        limiter.reset_client("a");

        let stats = limiter.get_client_stats("a");
        assert_eq!(stats.total_violations, 0);
        assert_eq!(stats.rules["one"].current_requests, 1);
        assert_eq!(limiter.get_global_stats().rules["one"].total_requests, 1);
        assert_eq!(limiter.get_global_stats().total_clients_with_violations, 0);
    }

    #[test]
    fn test_add_rule_replaces_window() {
        let (limiter, _clock) = limiter();
        limiter.add_rule("r", RateLimitRule::new(1, 60).unwrap());
        limiter.check_limit("r", "a", None);
        assert!(!limiter.check_limit("r", "a", None).0);

        limiter.add_rule("r", RateLimitRule::new(5, 60).unwrap());
        assert_eq!(limiter.get_global_stats().rules["r"].total_requests, 0);
        assert!(limiter.check_limit("r", "a", None).0);
    }

    #[test]
    fn test_client_stats_cover_every_rule() {
        let (limiter, _clock) = limiter();
        limiter.check_limit("api_data", "a", None);

        let stats = limiter.get_client_stats("a");
        assert_eq!(stats.client_id, "a");
        assert_eq!(stats.rules.len(), 5);
        assert_eq!(stats.rules["api_data"].current_requests, 1);
        assert_eq!(stats.rules["api_trading"].current_requests, 0);
        assert_eq!(stats.rules["api_trading"].remaining_time, 0.0);
    }

    #[test]
    fn test_global_stats_timestamp() {
        let (limiter, _clock) = limiter();
        assert_eq!(limiter.get_global_stats().timestamp, 10_000.0);
    }

    #[test]
    fn test_load_rules() {
        let (limiter, _clock) = limiter();
        let file = RulesFile::from_yaml(
            r#"
rules:
  api_quotes:
    requests_per_window: 30
    window_seconds: 10
"#,
        )
        .unwrap();

        assert_eq!(limiter.load_rules(&file).unwrap(), 1);
        assert_eq!(limiter.rule("api_quotes").unwrap().requests_per_window(), 30);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_quota() {
        let (limiter, _clock) = limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let client = format!("client-{}", i);
                    (0..5)
                        .filter(|_| limiter.check_limit("api_trading", &client, None).0)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
        assert_eq!(limiter.get_global_stats().rules["api_trading"].total_requests, 10);
    }
}
