//! Sliding window counter implementation.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::clock::Clock;

/// One request counted against a window.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRecord {
    /// When the request was admitted (seconds since the Unix epoch)
    pub timestamp: f64,
    /// Who made it
    pub client_id: String,
}

/// A counter that tracks admitted requests within a trailing time window.
///
/// The quota is shared by every client that goes through the owning rule;
/// per-client counts are a filtered view over the same records.
pub struct SlidingWindowCounter {
    /// Maximum requests admitted within one window
    max_requests: u64,
    /// Length of the trailing window in seconds
    window_seconds: u64,
    /// Admitted requests, oldest first
    records: Mutex<VecDeque<AdmissionRecord>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowCounter {
    /// Create a new counter.
    pub fn new(max_requests: u64, window_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window_seconds,
            records: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// Try to admit one request for `client_id`.
    ///
    /// Returns `true` if the request fits in the window. Denied requests are
    /// not recorded and do not consume budget.
    pub fn add_request(&self, client_id: &str) -> bool {
        let now = self.clock.now();
        let mut records = self.records.lock();
        self.prune(&mut records, now);

        if records.len() as u64 >= self.max_requests {
            return false;
        }

        records.push_back(AdmissionRecord {
            timestamp: now,
            client_id: client_id.to_string(),
        });
        true
    }

    /// Number of requests currently in the window, optionally only those of
    /// one client.
    pub fn get_request_count(&self, client_id: Option<&str>) -> usize {
        let now = self.clock.now();
        let mut records = self.records.lock();
        self.prune(&mut records, now);

        match client_id {
            Some(id) => records.iter().filter(|r| r.client_id == id).count(),
            None => records.len(),
        }
    }

    /// Seconds until the oldest record leaves the window.
    pub fn get_remaining_time(&self) -> f64 {
        let now = self.clock.now();
        let mut records = self.records.lock();
        self.prune(&mut records, now);

        match records.front() {
            Some(oldest) => (self.window_seconds as f64 - (now - oldest.timestamp)).max(0.0),
            None => 0.0,
        }
    }

    /// Get the quota for this counter.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Get the window length for this counter.
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Drop records that have aged out of the window.
    fn prune(&self, records: &mut VecDeque<AdmissionRecord>, now: f64) {
        let window = self.window_seconds as f64;
        while let Some(oldest) = records.front() {
            if now - oldest.timestamp >= window {
                records.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for SlidingWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowCounter")
            .field("max_requests", &self.max_requests)
            .field("window_seconds", &self.window_seconds)
            .field("records", &self.records.lock().len())
            .finish()
    }
}
