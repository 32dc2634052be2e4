use anyhow::Result;
use mailhive_common::CoordinatorConfig;
use mailhive_coordinator::run_coordinator;
use std::env;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let config = load_config_from_env();

    run_coordinator(config).await
}

fn load_config_from_env() -> CoordinatorConfig {
    let defaults = CoordinatorConfig::default();

    let grpc_port = env::var("COORDINATOR_GRPC_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(defaults.grpc_port);

    let http_port = env::var("COORDINATOR_HTTP_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(defaults.http_port);

    let result_timeout = env::var("COORDINATOR_RESULT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.result_timeout);

    let poll_window = env::var("COORDINATOR_POLL_WINDOW_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.poll_window);

    let announce_interval = env::var("COORDINATOR_ANNOUNCE_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.announce_interval);

    // Missed announcements before a worker stops being selected
    let stale_after_missed = env::var("COORDINATOR_STALE_AFTER_MISSED")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|missed| *missed > 0)
        .unwrap_or(defaults.stale_after_missed);

    let enable_metrics = env::var("COORDINATOR_ENABLE_METRICS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(defaults.enable_metrics);

    CoordinatorConfig {
        grpc_port,
        http_port,
        result_timeout,
        poll_window,
        announce_interval,
        stale_after_missed,
        enable_metrics,
    }
}
