use mailhive_common::{HiveError, HiveResult, ResponseEnvelope};
use mailhive_proto::dispatch::{self, dispatch_client::DispatchClient, ReadySignal};
use mailhive_proto::request_from_wire;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, error, info, warn};

use crate::handler::JobHandler;

const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF: Duration = Duration::from_millis(500);
// How long to wait for the coordinator to close the job stream on shutdown
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// RAII guard that automatically decrements active request counter on drop
struct ActiveRequestGuard {
    counter: Arc<AtomicUsize>,
}

impl ActiveRequestGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Polls the coordinator for requests addressed to this worker.
///
/// Each poll is one ReadySignal on the bidirectional stream followed by one
/// JobPoll answer; a received request is handled on its own task so the
/// loop keeps polling while batches run.
pub struct JobListener {
    worker_id: String,
    client: DispatchClient<Channel>,
    handler: Arc<JobHandler>,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
    active_requests: Arc<AtomicUsize>,
}

impl JobListener {
    pub fn new(
        worker_id: impl Into<String>,
        client: DispatchClient<Channel>,
        handler: Arc<JobHandler>,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            client,
            handler,
            poll_interval,
            cancellation_token,
            active_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests received and not yet answered
    pub fn active_requests(&self) -> Arc<AtomicUsize> {
        self.active_requests.clone()
    }

    /// Poll until cancelled; a broken stream is logged and re-opened after one interval
    pub async fn run(self) {
        info!(worker_id = %self.worker_id, "Starting job listener");

        loop {
            match self.listen_once().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, "Job stream broken: {}", e);
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Job listener stopped");
    }

    /// One stream lifetime. Ok means cancelled, Err means the stream broke.
    async fn listen_once(&self) -> HiveResult<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut client = self.client.clone();

        let response = tokio::select! {
            _ = self.cancellation_token.cancelled() => return Ok(()),
            response = client.listen_jobs(ReceiverStream::new(rx)) => response,
        };
        let mut inbound = response
            .map_err(|status| HiveError::Transport(status.to_string()))?
            .into_inner();

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let ready = ReadySignal {
                worker_id: self.worker_id.clone(),
            };
            tx.send(ready)
                .await
                .map_err(|_| HiveError::Transport("job stream closed".to_string()))?;

            let poll = tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                message = inbound.message() => message,
            };

            match poll {
                Ok(Some(poll)) => match poll.envelope {
                    Some(envelope) => self.spawn_request(envelope),
                    None => debug!(worker_id = %self.worker_id, "No request pending"),
                },
                Ok(None) => {
                    return Err(HiveError::Transport(
                        "coordinator closed the job stream".to_string(),
                    ))
                }
                Err(status) => return Err(HiveError::Transport(status.to_string())),
            }
        }

        // Closing our half tells the coordinator to stop polling for us; an
        // answer it already sent still has to be taken
        drop(tx);
        self.drain(inbound).await;
        Ok(())
    }

    /// Read the job stream until the coordinator closes it, handling any request still on it
    async fn drain(&self, mut inbound: Streaming<dispatch::JobPoll>) {
        let drained = tokio::time::timeout(STREAM_DRAIN_TIMEOUT, async {
            while let Ok(Some(poll)) = inbound.message().await {
                if let Some(envelope) = poll.envelope {
                    info!(worker_id = %self.worker_id, "Taking request delivered during shutdown");
                    self.spawn_request(envelope);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.worker_id,
                "Job stream not closed by coordinator within {:?}",
                STREAM_DRAIN_TIMEOUT
            );
        }
    }

    fn spawn_request(&self, wire: dispatch::RequestEnvelope) {
        let envelope = match request_from_wire(wire) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(worker_id = %self.worker_id, "Dropping malformed request: {}", e);
                return;
            }
        };

        let guard = ActiveRequestGuard::new(self.active_requests.clone());
        let handler = self.handler.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let response = handler.handle(envelope).await;
            submit_result(client, response).await;
        });
    }
}

/// Send the one response for a request, retrying transient transport failures
pub async fn submit_result(mut client: DispatchClient<Channel>, response: ResponseEnvelope) {
    let request_id = response.request_id;
    let wire = dispatch::ResponseEnvelope::from(response);

    for attempt in 1..=SUBMIT_ATTEMPTS {
        match client.submit_result(wire.clone()).await {
            Ok(_) => {
                debug!(request_id = %request_id, "Result submitted");
                return;
            }
            Err(status) => {
                warn!(
                    request_id = %request_id,
                    "Submitting result failed (attempt {}/{}): {}",
                    attempt,
                    SUBMIT_ATTEMPTS,
                    status
                );
                if attempt < SUBMIT_ATTEMPTS {
                    tokio::time::sleep(SUBMIT_BACKOFF).await;
                }
            }
        }
    }

    error!(request_id = %request_id, "Giving up on result submission");
}
