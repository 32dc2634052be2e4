// Worker binary: launches Chrome, then serves jobs for the coordinator at
// COORDINATOR_ENDPOINT until Ctrl+C or SIGTERM.

use anyhow::Result;
use mailhive_worker::run_worker;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration from environment
    let config = load_config_from_env()?;

    run_worker(config).await
}

fn load_config_from_env() -> Result<mailhive_common::WorkerConfig> {
    use mailhive_common::{BrowserConfig, PoolConfig, QueueConfig, WorkerConfig};
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;

    let defaults = WorkerConfig::default();

    let worker_id = env::var("WORKER_ID").unwrap_or(defaults.worker_id);
    let coordinator_endpoint =
        env::var("COORDINATOR_ENDPOINT").unwrap_or(defaults.coordinator_endpoint);

    // Browsers launched at startup, one Chrome process each
    let pool_capacity = env::var("WORKER_POOL_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.pool.capacity);

    let loan_timeout = env::var("WORKER_LOAN_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.pool.loan_timeout);

    // Chunk size: jobs handed to one browser per loan
    let max_tasks = env::var("WORKER_MAX_JOBS_PER_BROWSER")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.queue.max_tasks);

    let max_running = env::var("WORKER_MAX_RUNNING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.queue.max_running);

    let job_timeout = env::var("WORKER_JOB_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.queue.job_timeout);

    let status_interval = env::var("WORKER_STATUS_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.status_interval);

    let poll_interval = env::var("WORKER_POLL_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.poll_interval);

    let headless = env::var("WORKER_HEADLESS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(defaults.browser.headless);

    let no_sandbox = env::var("WORKER_NO_SANDBOX")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(defaults.browser.no_sandbox);

    // If not set, uses default Chrome/Chromium auto-detection
    let browser_path: Option<PathBuf> = env::var("WORKER_BROWSER_PATH").ok().map(PathBuf::from);

    let search_base_url = env::var("WORKER_SEARCH_BASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty());

    let metrics_port = env::var("WORKER_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(defaults.metrics_port);

    let config = WorkerConfig {
        worker_id,
        coordinator_endpoint,
        pool: PoolConfig {
            capacity: pool_capacity,
            loan_timeout,
        },
        queue: QueueConfig {
            max_tasks,
            max_running,
            job_timeout,
        },
        browser: BrowserConfig {
            headless,
            no_sandbox,
            browser_path,
        },
        status_interval,
        poll_interval,
        search_base_url,
        metrics_port,
    };
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhive_common::WorkerConfig;

    #[test]
    fn test_unset_variables_fall_back_to_config_defaults() {
        let config = load_config_from_env().unwrap();
        let defaults = WorkerConfig::default();

        assert_eq!(config.pool.loan_timeout, defaults.pool.loan_timeout);
        assert_eq!(config.queue.job_timeout, defaults.queue.job_timeout);
        assert_eq!(config.status_interval, defaults.status_interval);
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.browser.headless, defaults.browser.headless);
    }
}
