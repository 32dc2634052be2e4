use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Browser launch options for one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub headless: bool, // false = visible window, only useful when debugging extraction steps
    /// Needed inside containers that lack the SYS_ADMIN capability
    pub no_sandbox: bool,
    /// Path to browser binary. If None, uses default Chrome/Chromium auto-detection.
    pub browser_path: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            no_sandbox: false,
            browser_path: None,
        }
    }
}

/// Fixed-size browser pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of browser resources launched at startup
    pub capacity: usize,
    /// How long `loan()` waits for an idle resource before giving up
    #[serde(with = "humantime_serde")]
    pub loan_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            loan_timeout: Duration::from_secs(2),
        }
    }
}

/// Per-browser job admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs handed to one browser per loan (chunk size)
    pub max_tasks: usize,
    /// Jobs allowed in flight on one browser at the same time
    pub max_running: usize,
    /// Wall-clock budget of a single job
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tasks: 5,
            max_running: 3,
            job_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub coordinator_endpoint: String,
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub browser: BrowserConfig,
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Base link of the search result API; keyword jobs fail without it
    pub search_base_url: Option<String>,
    pub metrics_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            coordinator_endpoint: "http://127.0.0.1:50051".to_string(),
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
            browser: BrowserConfig::default(),
            status_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            search_base_url: None,
            metrics_port: 9090,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.trim().is_empty() {
            anyhow::bail!("worker_id must not be empty");
        }
        if self.pool.capacity == 0 {
            anyhow::bail!("pool capacity must be at least 1");
        }
        if self.queue.max_tasks == 0 {
            anyhow::bail!("max_tasks must be at least 1");
        }
        if self.queue.max_running == 0 {
            anyhow::bail!("max_running must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub grpc_port: u16,
    pub http_port: u16,
    /// Deadline for a dispatched request's response
    #[serde(with = "humantime_serde")]
    pub result_timeout: Duration,
    /// How long a ListenJobs poll waits on an empty mailbox before answering "nothing"
    #[serde(with = "humantime_serde")]
    pub poll_window: Duration,
    /// Interval workers are expected to announce at
    #[serde(with = "humantime_serde")]
    pub announce_interval: Duration,
    /// Announcements a worker may miss before selection ignores it
    pub stale_after_missed: u32,
    pub enable_metrics: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50051,
            http_port: 8080,
            result_timeout: Duration::from_secs(330), // 5 min job budget plus transport slack
            poll_window: Duration::from_secs(1),
            announce_interval: Duration::from_secs(1),
            stale_after_missed: 5,
            enable_metrics: true,
        }
    }
}

impl CoordinatorConfig {
    /// Age after which a worker slot no longer takes part in selection
    pub fn stale_after(&self) -> Duration {
        self.announce_interval * self.stale_after_missed
    }
}
