mod api;
mod correlator;
mod dispatcher;
mod mailbox;
mod metrics;
mod registry;
mod service;

pub use api::{router, status_for, validate_keyword, validate_urls, AppState, FieldError};
pub use correlator::ResultCorrelator;
pub use dispatcher::{JobDispatcher, WORKER_EXITED};
pub use mailbox::Mailboxes;
pub use metrics::Metrics;
pub use registry::{select_worker, WorkerRegistry, WorkerSlot, WorkerSummary};
pub use service::DispatchService;

use anyhow::Result;
use axum::Router;
use mailhive_common::CoordinatorConfig;
use mailhive_proto::dispatch::dispatch_server::DispatchServer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

// Slots silent for this many stale windows are dropped from the registry
const PRUNE_AFTER_STALE_WINDOWS: u32 = 10;

/// All coordinator state, wired together.
///
/// `shutdown_token` stops new dispatches and the HTTP front door. The worker
/// streams run on their own token, cancelled by [`Coordinator::serve`] only
/// after in-flight dispatches drained, so workers can still deliver results.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    mailboxes: Arc<Mailboxes>,
    correlator: Arc<ResultCorrelator>,
    dispatcher: Arc<JobDispatcher>,
    metrics: Metrics,
    shutdown_token: CancellationToken,
    streams_token: CancellationToken,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, shutdown_token: CancellationToken) -> Result<Self> {
        info!(
            "Initializing coordinator (result timeout: {:?}, stale after: {:?})",
            config.result_timeout,
            config.stale_after()
        );

        let registry = Arc::new(WorkerRegistry::new(config.stale_after()));
        let mailboxes = Arc::new(Mailboxes::new());
        let correlator = Arc::new(ResultCorrelator::new());
        let metrics = Metrics::new()?;
        let dispatcher = Arc::new(JobDispatcher::new(
            registry.clone(),
            mailboxes.clone(),
            correlator.clone(),
            config.result_timeout,
            metrics.clone(),
            shutdown_token.clone(),
        ));

        Ok(Self {
            config,
            registry,
            mailboxes,
            correlator,
            dispatcher,
            metrics,
            shutdown_token,
            streams_token: CancellationToken::new(),
        })
    }

    pub fn dispatcher(&self) -> Arc<JobDispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    pub fn mailboxes(&self) -> Arc<Mailboxes> {
        self.mailboxes.clone()
    }

    pub fn grpc_service(&self) -> DispatchServer<DispatchService> {
        DispatchServer::new(DispatchService::new(
            self.registry.clone(),
            self.mailboxes.clone(),
            self.correlator.clone(),
            self.dispatcher.clone(),
            self.metrics.clone(),
            self.config.poll_window,
            self.streams_token.clone(),
        ))
    }

    pub fn http_router(&self) -> Router {
        router(
            AppState {
                dispatcher: self.dispatcher.clone(),
                metrics: self.metrics.clone(),
            },
            self.config.enable_metrics,
        )
    }

    /// Start background task that drops workers silent for too long
    pub fn start_pruner(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let metrics = self.metrics.clone();
        let cancellation_token = self.streams_token.clone();
        let stale_after = self.config.stale_after();
        let max_age = stale_after * PRUNE_AFTER_STALE_WINDOWS;

        tokio::spawn(async move {
            info!("Starting registry pruner (max age {:?})", max_age);
            let mut interval = tokio::time::interval(stale_after.max(Duration::from_millis(100)));

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Registry pruner stopping due to cancellation");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker_id in registry.prune(max_age) {
                            dispatcher.fail_queued(&worker_id);
                        }
                        metrics.workers.set(registry.len() as i64);
                    }
                }
            }
        })
    }

    /// Serve gRPC and HTTP on the given listeners until `shutdown_token` fires,
    /// then drain in-flight dispatches and close the worker streams.
    pub async fn serve(self, grpc_listener: TcpListener, http_listener: TcpListener) -> Result<()> {
        info!("Coordinator gRPC server listening on {}", grpc_listener.local_addr()?);
        info!("Coordinator HTTP server listening on {}", http_listener.local_addr()?);

        let pruner = self.start_pruner();

        let streams_token = self.streams_token.clone();
        let grpc = tokio::spawn(
            Server::builder()
                .add_service(self.grpc_service())
                .serve_with_incoming_shutdown(TcpListenerStream::new(grpc_listener), async move {
                    streams_token.cancelled().await
                }),
        );

        let shutdown_token = self.shutdown_token.clone();
        let http_result = axum::serve(http_listener, self.http_router())
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await;
        if let Err(e) = &http_result {
            error!("HTTP server error: {}", e);
        }

        let active_requests = self.dispatcher.active_requests();
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

        self.streams_token.cancel();
        let grpc_result = grpc.await?;
        let _ = pruner.await;

        http_result?;
        grpc_result?;
        info!("Coordinator shutdown complete");
        Ok(())
    }
}

/// Run the coordinator on the configured ports until Ctrl+C or SIGTERM
pub async fn run_coordinator(config: CoordinatorConfig) -> Result<()> {
    info!(
        "Starting coordinator (gRPC port {}, HTTP port {})",
        config.grpc_port, config.http_port
    );

    let grpc_listener = TcpListener::bind(("0.0.0.0", config.grpc_port)).await?;
    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;

    let shutdown_token = CancellationToken::new();
    let coordinator = Coordinator::new(config, shutdown_token.clone())?;
    tokio::spawn(shutdown_signal(shutdown_token));

    coordinator.serve(grpc_listener, http_listener).await
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

    info!("Refusing new requests and draining...");
    cancellation_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhive_common::{HiveError, JobPayload};
    use mailhive_proto::dispatch::dispatch_client::DispatchClient;
    use mailhive_proto::dispatch::{ExitNotice, ReadySignal};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let token = CancellationToken::new();
        let coordinator = Coordinator::new(CoordinatorConfig::default(), token.clone()).unwrap();

        let grpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(coordinator.serve(grpc_listener, http_listener));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("coordinator should stop after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pruner_drops_silent_workers() {
        let config = CoordinatorConfig {
            announce_interval: Duration::from_millis(10),
            stale_after_missed: 1,
            ..Default::default()
        };
        let coordinator = Coordinator::new(config, CancellationToken::new()).unwrap();
        coordinator.registry().upsert("worker-1", 3);

        let pruner = coordinator.start_pruner();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(coordinator.registry().is_empty());
        coordinator.streams_token.cancel();
        pruner.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_for_worker_that_stopped_polling_fails_on_exit() {
        let config = CoordinatorConfig {
            poll_window: Duration::from_secs(5),
            ..Default::default()
        };
        let token = CancellationToken::new();
        let coordinator = Coordinator::new(config, token.clone()).unwrap();
        let registry = coordinator.registry();
        let mailboxes = coordinator.mailboxes();
        let dispatcher = coordinator.dispatcher();

        let grpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let grpc_addr = grpc_listener.local_addr().unwrap();
        let server = tokio::spawn(coordinator.serve(grpc_listener, http_listener));

        let mut client = DispatchClient::connect(format!("http://{}", grpc_addr))
            .await
            .unwrap();
        registry.upsert("worker-1", 5);

        // Poll once, then close the ready stream while that poll is outstanding
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let mut polls = client
            .listen_jobs(ReceiverStream::new(ready_rx))
            .await
            .unwrap()
            .into_inner();
        ready_tx
            .send(ReadySignal {
                worker_id: "worker-1".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(ready_tx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let call = tokio::spawn(async move {
            dispatcher
                .dispatch(JobPayload::MailsFromUrls(vec!["https://example.com".to_string()]))
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mailboxes.pending("worker-1"), 1);

        client
            .notify_exit(ExitNotice {
                worker_id: "worker-1".to_string(),
            })
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("waiter should be released by the exit notice")
            .unwrap()
            .unwrap_err();
        assert_eq!(err, HiveError::Remote(WORKER_EXITED.to_string()));
        assert!(polls.message().await.unwrap().is_none());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("coordinator should stop after shutdown")
            .unwrap()
            .unwrap();
    }
}
