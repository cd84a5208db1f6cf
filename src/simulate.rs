//! Concurrent load driver.
//!
//! Spawns one blocking task per simulated client, all hammering the same
//! rule, and summarises who got through. Useful for eyeballing the shared
//! window and cooldown behaviour of a rule set before wiring it in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::ratelimit::{GlobalStats, RateLimiter};

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub rule: String,
    pub clients: usize,
    pub requests_per_client: usize,
    /// Upper bound on the random pause between a client's requests
    pub max_jitter: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientOutcome {
    pub client_id: String,
    pub admitted: usize,
    pub denied: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub rule: String,
    pub admitted: usize,
    pub denied: usize,
    pub clients: Vec<ClientOutcome>,
    pub global: GlobalStats,
}

/// Run the plan against `limiter` and wait for every client to finish.
///
/// Setting `stop` makes each client quit before its next request; the
/// report then covers whatever was sent so far.
pub async fn run(
    limiter: Arc<RateLimiter>,
    plan: SimulationPlan,
    stop: Arc<AtomicBool>,
) -> Result<SimulationReport> {
    info!(
        rule = %plan.rule,
        clients = plan.clients,
        requests_per_client = plan.requests_per_client,
        "Starting simulation"
    );

    let tasks = (0..plan.clients).map(|i| {
        let limiter = limiter.clone();
        let stop = stop.clone();
        let rule = plan.rule.clone();
        let requests = plan.requests_per_client;
        let max_jitter_ms = plan.max_jitter.as_millis() as u64;

        tokio::task::spawn_blocking(move || {
            let client_id = format!("client-{}", i);
            let mut rng = rand::thread_rng();
            let mut outcome = ClientOutcome {
                client_id,
                admitted: 0,
                denied: 0,
            };

            for _ in 0..requests {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let (allowed, _) = limiter.check_limit(&rule, &outcome.client_id, None);
                if allowed {
                    outcome.admitted += 1;
                } else {
                    outcome.denied += 1;
                }

                if max_jitter_ms > 0 {
                    std::thread::sleep(Duration::from_millis(rng.gen_range(0..=max_jitter_ms)));
                }
            }

            debug!(
                client_id = %outcome.client_id,
                admitted = outcome.admitted,
                denied = outcome.denied,
                "Simulated client finished"
            );
            outcome
        })
    });

    let mut clients = Vec::with_capacity(plan.clients);
    for result in join_all(tasks).await {
        clients.push(result?);
    }

    let admitted: usize = clients.iter().map(|c| c.admitted).sum();
    let denied: usize = clients.iter().map(|c| c.denied).sum();

    info!(
        rule = %plan.rule,
        admitted,
        denied,
        stopped_early = stop.load(Ordering::Relaxed),
        "Simulation finished"
    );

    Ok(SimulationReport {
        rule: plan.rule,
        admitted,
        denied,
        clients,
        global: limiter.get_global_stats(),
    })
}
