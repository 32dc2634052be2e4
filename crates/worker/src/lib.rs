mod actions;
mod browser;
mod browser_pool;
mod handler;
mod listener;
mod metrics;
mod orchestrator;
mod search;
mod status;
mod task_queue;

pub use actions::{extract_emails, normalize_mail, ExtractMails};
pub use browser::{BrowserAction, BrowserEngine, BrowserPage, BrowserResource, HeadlessChromeEngine};
pub use browser_pool::BrowserPool;
pub use handler::JobHandler;
pub use listener::JobListener;
pub use metrics::Metrics;
pub use orchestrator::{jobs_from_urls, jobs_from_websites, JobOrchestrator};
pub use search::{KeywordSearch, SerpSearch};
pub use status::StatusReporter;
pub use task_queue::{Job, TaskQueue};

use anyhow::Result;
use mailhive_common::WorkerConfig;
use mailhive_proto::dispatch::{dispatch_client::DispatchClient, ExitNotice};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{error, info, warn};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Run a worker with Chrome browsers until Ctrl+C or SIGTERM
///
/// # Example
///
/// ```rust,ignore
/// use mailhive_common::WorkerConfig;
/// use mailhive_worker::run_worker;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = WorkerConfig {
///         worker_id: "worker-1".to_string(),
///         coordinator_endpoint: "http://coordinator:50051".to_string(),
///         ..Default::default()
///     };
///     run_worker(config).await
/// }
/// ```
pub async fn run_worker(config: WorkerConfig) -> Result<()> {
    config.validate()?;
    info!(
        "Starting worker {} (pool: {}, jobs per browser: {}, max running: {})",
        config.worker_id, config.pool.capacity, config.queue.max_tasks, config.queue.max_running
    );

    let metrics = Metrics::new(&config.worker_id)?;
    let pool = Arc::new(BrowserPool::launch(&config).await?);

    let search: Option<Arc<dyn KeywordSearch>> = match &config.search_base_url {
        Some(base_link) => Some(Arc::new(SerpSearch::new(base_link.clone())?)),
        None => {
            warn!("WORKER_SEARCH_BASE_URL not set, keyword requests will be refused");
            None
        }
    };

    // Start metrics HTTP server in background
    let metrics_port = config.metrics_port;
    let metrics_server = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics_server.start_server(metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let cancellation_token = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancellation_token.clone()));

    serve_worker(
        config,
        pool,
        Arc::new(ExtractMails),
        search,
        metrics,
        cancellation_token,
    )
    .await
}

/// Connect to the coordinator and run the status and job loops on the given
/// pool until `cancellation_token` fires, then announce exit and drain.
pub async fn serve_worker(
    config: WorkerConfig,
    pool: Arc<BrowserPool>,
    action: Arc<dyn BrowserAction>,
    search: Option<Arc<dyn KeywordSearch>>,
    metrics: Metrics,
    cancellation_token: CancellationToken,
) -> Result<()> {
    config.validate()?;

    let client = connect_with_retry(&config.coordinator_endpoint, &cancellation_token).await?;
    info!(
        worker_id = %config.worker_id,
        "Connected to coordinator at {}",
        config.coordinator_endpoint
    );

    let orchestrator = Arc::new(JobOrchestrator::new(
        pool.clone(),
        config.queue.max_tasks,
        action,
    ));
    let handler = Arc::new(JobHandler::new(
        config.worker_id.clone(),
        orchestrator.clone(),
        search,
        metrics.clone(),
    ));

    let reporter = StatusReporter::new(
        config.worker_id.clone(),
        client.clone(),
        orchestrator,
        metrics,
        config.status_interval,
        cancellation_token.clone(),
    );
    let listener = JobListener::new(
        config.worker_id.clone(),
        client.clone(),
        handler,
        config.poll_interval,
        cancellation_token.clone(),
    );
    let active_requests = listener.active_requests();

    let reporter_handle = tokio::spawn(reporter.run());
    let listener_handle = tokio::spawn(listener.run());

    cancellation_token.cancelled().await;
    let _ = reporter_handle.await;
    let _ = listener_handle.await;

    // Stop being selected before draining what is still running
    let mut exit_client = client;
    match exit_client
        .notify_exit(ExitNotice {
            worker_id: config.worker_id.clone(),
        })
        .await
    {
        Ok(_) => info!(worker_id = %config.worker_id, "Exit announced to coordinator"),
        Err(status) => warn!(worker_id = %config.worker_id, "Failed to announce exit: {}", status),
    }

    let active_count = active_requests.load(Ordering::SeqCst);
    if active_count > 0 {
        info!(
            "Starting graceful shutdown, waiting for {} active request(s) to complete...",
            active_count
        );

        loop {
            let remaining = active_requests.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            info!("Waiting for {} request(s) to complete...", remaining);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        info!("All active requests completed");
    } else {
        info!("Starting graceful shutdown, no active requests");
    }

    pool.shutdown().await;
    info!(worker_id = %config.worker_id, "Worker shutdown complete");
    Ok(())
}

async fn connect_with_retry(
    endpoint: &str,
    cancellation_token: &CancellationToken,
) -> Result<DispatchClient<Channel>> {
    loop {
        match DispatchClient::connect(endpoint.to_string()).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                warn!("Coordinator at {} not reachable yet: {}", endpoint, e);
            }
        }

        tokio::select! {
            _ = cancellation_token.cancelled() => {
                anyhow::bail!("Cancelled before the coordinator became reachable");
            }
            _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
        }
    }
}

/// Cancel `cancellation_token` on Ctrl+C or SIGTERM
pub async fn shutdown_signal(cancellation_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
    }

    // Cancel all ongoing operations
    info!("Cancelling all active operations...");
    cancellation_token.cancel();
}
