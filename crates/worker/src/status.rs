use mailhive_common::HiveError;
use mailhive_proto::dispatch::{dispatch_client::DispatchClient, StatusAnnouncement};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::orchestrator::JobOrchestrator;

// How long to wait for the coordinator's ack once the announce stream is closed
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically announces this worker's free capacity over one client stream
pub struct StatusReporter {
    worker_id: String,
    client: DispatchClient<Channel>,
    orchestrator: Arc<JobOrchestrator>,
    metrics: Metrics,
    interval: Duration,
    cancellation_token: CancellationToken,
}

enum StreamEnd {
    Cancelled,
    Broken(HiveError),
}

impl StatusReporter {
    pub fn new(
        worker_id: impl Into<String>,
        client: DispatchClient<Channel>,
        orchestrator: Arc<JobOrchestrator>,
        metrics: Metrics,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            client,
            orchestrator,
            metrics,
            interval,
            cancellation_token,
        }
    }

    /// Current announcement: idle browsers times jobs per browser
    pub fn announcement(&self) -> StatusAnnouncement {
        let pool = self.orchestrator.pool();
        let free_capacity = self.orchestrator.free_capacity();
        self.metrics
            .record_pool(pool.idle_count(), pool.active_count(), free_capacity);

        StatusAnnouncement {
            worker_id: self.worker_id.clone(),
            free_capacity: u32::try_from(free_capacity).unwrap_or(u32::MAX),
        }
    }

    /// Announce until cancelled, re-opening the stream whenever it breaks
    pub async fn run(self) {
        info!(worker_id = %self.worker_id, "Starting status reporter");

        loop {
            match self.announce_over_stream().await {
                StreamEnd::Cancelled => break,
                StreamEnd::Broken(e) => {
                    warn!(worker_id = %self.worker_id, "Status stream broken: {}", e);
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(self.interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Status reporter stopped");
    }

    async fn announce_over_stream(&self) -> StreamEnd {
        let (tx, rx) = mpsc::channel(4);
        let mut client = self.client.clone();
        let call = tokio::spawn(async move {
            client.announce_status(ReceiverStream::new(rx)).await
        });

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break StreamEnd::Cancelled,
                _ = interval.tick() => {
                    let announcement = self.announcement();
                    debug!(
                        worker_id = %self.worker_id,
                        "Announcing free capacity {}",
                        announcement.free_capacity
                    );
                    if tx.send(announcement).await.is_err() {
                        break StreamEnd::Broken(HiveError::Transport(
                            "status stream closed by coordinator".to_string(),
                        ));
                    }
                }
            }
        };

        // Closing the sender ends the client stream so the call can complete
        drop(tx);
        match tokio::time::timeout(STREAM_CLOSE_TIMEOUT, call).await {
            Ok(Ok(Err(status))) if matches!(end, StreamEnd::Broken(_)) => {
                StreamEnd::Broken(HiveError::Transport(status.to_string()))
            }
            Ok(Err(e)) => StreamEnd::Broken(HiveError::Transport(format!(
                "status call task failed: {}",
                e
            ))),
            Err(_) => {
                debug!(worker_id = %self.worker_id, "Status call did not finish after stream close");
                end
            }
            _ => end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakeEngine, SleepAction};
    use crate::browser::BrowserEngine;
    use crate::browser_pool::BrowserPool;
    use tonic::transport::Endpoint;

    fn make_reporter(capacity: usize, max_tasks: usize) -> StatusReporter {
        let engines: Vec<Arc<dyn BrowserEngine>> = (0..capacity)
            .map(|_| Arc::new(FakeEngine::default()) as Arc<dyn BrowserEngine>)
            .collect();
        let pool = BrowserPool::new(engines, Duration::from_secs(5), 2, Duration::from_millis(50))
            .unwrap();
        let orchestrator = JobOrchestrator::new(
            Arc::new(pool),
            max_tasks,
            Arc::new(SleepAction::new(Duration::from_millis(1))),
        );
        // Lazy channel: nothing connects unless a call is made
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();

        StatusReporter::new(
            "worker-1",
            DispatchClient::new(channel),
            Arc::new(orchestrator),
            Metrics::new("worker-1").unwrap(),
            Duration::from_millis(10),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_announcement_tracks_idle_browsers() {
        let reporter = make_reporter(3, 5);
        assert_eq!(reporter.announcement().free_capacity, 15);

        let loaned = reporter.orchestrator.pool().loan().await.unwrap();
        let announcement = reporter.announcement();
        assert_eq!(announcement.worker_id, "worker-1");
        assert_eq!(announcement.free_capacity, 10);

        reporter.orchestrator.pool().release(loaned).await.unwrap();
        assert_eq!(reporter.announcement().free_capacity, 15);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation_without_coordinator() {
        let reporter = make_reporter(1, 1);
        let token = reporter.cancellation_token.clone();

        let handle = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reporter should stop after cancellation")
            .unwrap();
    }
}
