use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tradegate::config::{LoggingConfig, TradegateConfig};
use tradegate::guard::RateLimitExceeded;
use tradegate::ratelimit::{RateLimitRule, RateLimiter, RulesFile, DEFAULT_RULE};
use tradegate::report::TracingReporter;
use tradegate::simulate::{self, SimulationPlan};

#[derive(Debug, Parser)]
#[command(name = "tradegate", version, about = "Sliding-window rate limiter for the trading dashboard")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra rules file, added on top of the configured ones
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the registered rules
    Rules,
    /// Run admission checks for one client, then print its stats
    Check {
        #[arg(long, default_value = DEFAULT_RULE)]
        rule: String,
        #[arg(long)]
        client: String,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Drive concurrent load against one rule
    Simulate {
        #[arg(long, default_value = DEFAULT_RULE)]
        rule: String,
        #[arg(long, default_value_t = 10)]
        clients: usize,
        #[arg(long, default_value_t = 20)]
        requests: usize,
        #[arg(long, default_value_t = 0)]
        jitter_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TradegateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // One limiter for the whole process, handed to everything that needs it
    let limiter = Arc::new(RateLimiter::new());

    let rules_paths = config
        .rate_limiting
        .rules_path
        .iter()
        .map(PathBuf::from)
        .chain(cli.rules.clone());
    for path in rules_paths {
        let loaded = limiter.load_rules(&RulesFile::from_file(&path)?)?;
        info!(path = %path.display(), rules = loaded, "Rules loaded");
    }

    match cli.command {
        Command::Rules => {
            let rules: BTreeMap<String, RateLimitRule> = limiter
                .rule_names()
                .into_iter()
                .filter_map(|name| limiter.rule(&name).map(|rule| (name, rule)))
                .collect();
            print_json(&rules)?;
        }
        Command::Check {
            rule,
            client,
            endpoint,
            count,
        } => {
            for _ in 0..count {
                let (allowed, limit_info) =
                    limiter.check_limit(&rule, &client, endpoint.as_deref());
                print_json(&limit_info)?;
                if !allowed {
                    let denial = RateLimitExceeded {
                        rule_name: rule.clone(),
                        client_id: client.clone(),
                        limit_info,
                    };
                    denial.report(&TracingReporter);
                }
            }
            print_json(&limiter.get_client_stats(&client))?;
        }
        Command::Simulate {
            rule,
            clients,
            requests,
            jitter_ms,
        } => {
            let plan = SimulationPlan {
                rule,
                clients,
                requests_per_client: requests,
                max_jitter: Duration::from_millis(jitter_ms),
            };

            let stop = Arc::new(AtomicBool::new(false));
            let stop_on_signal = stop.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, stopping simulated clients");
                    stop_on_signal.store(true, Ordering::Relaxed);
                }
            });

            let report = simulate::run(limiter.clone(), plan, stop).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so that stdout stays machine-readable
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
