//! Rate limiting logic and state management.

mod clock;
mod counter;
mod limiter;
mod rules;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{AdmissionRecord, SlidingWindowCounter};
pub use limiter::RateLimiter;
pub use rules::{default_rules, RateLimitRule, RuleConfig, RulesFile, DEFAULT_RULE};
pub use stats::{ClientRuleStats, ClientStats, GlobalRuleStats, GlobalStats, LimitInfo};
