use mailhive_proto::dispatch::{
    dispatch_server::Dispatch, Ack, ExitNotice, JobPoll, ReadySignal, ResponseEnvelope,
    StatusAnnouncement,
};
use mailhive_proto::response_from_wire;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::correlator::ResultCorrelator;
use crate::dispatcher::JobDispatcher;
use crate::mailbox::Mailboxes;
use crate::metrics::Metrics;
use crate::registry::WorkerRegistry;

/// Worker-facing side of the coordinator
pub struct DispatchService {
    registry: Arc<WorkerRegistry>,
    mailboxes: Arc<Mailboxes>,
    correlator: Arc<ResultCorrelator>,
    dispatcher: Arc<JobDispatcher>,
    metrics: Metrics,
    poll_window: Duration,
    cancellation_token: CancellationToken,
}

impl DispatchService {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        mailboxes: Arc<Mailboxes>,
        correlator: Arc<ResultCorrelator>,
        dispatcher: Arc<JobDispatcher>,
        metrics: Metrics,
        poll_window: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            mailboxes,
            correlator,
            dispatcher,
            metrics,
            poll_window,
            cancellation_token,
        }
    }

    fn record_workers(&self) {
        self.metrics.workers.set(self.registry.len() as i64);
    }
}

#[tonic::async_trait]
impl Dispatch for DispatchService {
    async fn announce_status(
        &self,
        request: Request<Streaming<StatusAnnouncement>>,
    ) -> Result<Response<Ack>, Status> {
        let mut inbound = request.into_inner();
        let mut announcer: Option<String> = None;

        loop {
            let message = tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                message = inbound.message() => message,
            };

            match message {
                Ok(Some(announcement)) => {
                    if announcement.worker_id.is_empty() {
                        return Err(Status::invalid_argument("announcement without worker_id"));
                    }
                    self.registry
                        .upsert(&announcement.worker_id, announcement.free_capacity as usize);
                    self.record_workers();
                    announcer = Some(announcement.worker_id);
                }
                Ok(None) => break,
                Err(status) => {
                    warn!(
                        worker_id = ?announcer,
                        "Status stream failed: {}",
                        status
                    );
                    break;
                }
            }
        }

        debug!(worker_id = ?announcer, "Status stream closed");
        Ok(Response::new(Ack {}))
    }

    type ListenJobsStream = ReceiverStream<Result<JobPoll, Status>>;

    async fn listen_jobs(
        &self,
        request: Request<Streaming<ReadySignal>>,
    ) -> Result<Response<Self::ListenJobsStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        let mailboxes = self.mailboxes.clone();
        let dispatcher = self.dispatcher.clone();
        let poll_window = self.poll_window;
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    message = inbound.message() => message,
                };

                let ready = match message {
                    Ok(Some(ready)) => ready,
                    Ok(None) => break,
                    Err(status) => {
                        warn!("Job stream failed: {}", status);
                        break;
                    }
                };

                if ready.worker_id.is_empty() {
                    let _ = tx
                        .send(Err(Status::invalid_argument("ready signal without worker_id")))
                        .await;
                    break;
                }

                // One ready signal per answer: anything arriving mid-poll means the
                // worker closed its side, so stop before popping a request for it
                let envelope = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    envelope = mailboxes.pop_wait(&ready.worker_id, poll_window) => envelope,
                    message = inbound.message() => {
                        if let Ok(Some(_)) = message {
                            let _ = tx
                                .send(Err(Status::failed_precondition(
                                    "ready signal sent while a poll was outstanding",
                                )))
                                .await;
                        }
                        debug!(worker_id = %ready.worker_id, "Worker stopped polling");
                        break;
                    }
                };

                if let Some(envelope) = &envelope {
                    debug!(
                        request_id = %envelope.request_id,
                        worker_id = %ready.worker_id,
                        "Handing request to worker"
                    );
                }

                let poll = JobPoll {
                    envelope: envelope.clone().map(Into::into),
                };
                if tx.send(Ok(poll)).await.is_err() {
                    // The worker hung up between its ready signal and our answer
                    if let Some(envelope) = envelope {
                        dispatcher.return_undelivered(envelope);
                    }
                    break;
                }
            }

            debug!("Job stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn submit_result(
        &self,
        request: Request<ResponseEnvelope>,
    ) -> Result<Response<Ack>, Status> {
        let response = response_from_wire(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let request_id = response.request_id;
        if self.correlator.complete(response) {
            debug!(request_id = %request_id, "Result correlated");
        }

        // A late result is still acknowledged so the worker does not retry it
        Ok(Response::new(Ack {}))
    }

    async fn notify_exit(&self, request: Request<ExitNotice>) -> Result<Response<Ack>, Status> {
        let notice = request.into_inner();
        if notice.worker_id.is_empty() {
            return Err(Status::invalid_argument("exit notice without worker_id"));
        }

        self.registry.remove(&notice.worker_id);
        let failed = self.dispatcher.fail_queued(&notice.worker_id);
        self.record_workers();

        info!(
            worker_id = %notice.worker_id,
            "Worker exited ({} queued request(s) failed)",
            failed
        );
        Ok(Response::new(Ack {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhive_common::{JobKind, JobPayload, RequestEnvelope};
    use mailhive_proto::dispatch;

    const STALE_AFTER: Duration = Duration::from_secs(5);

    struct Fixture {
        service: DispatchService,
        registry: Arc<WorkerRegistry>,
        mailboxes: Arc<Mailboxes>,
        correlator: Arc<ResultCorrelator>,
    }

    fn make_service() -> Fixture {
        let registry = Arc::new(WorkerRegistry::new(STALE_AFTER));
        let mailboxes = Arc::new(Mailboxes::new());
        let correlator = Arc::new(ResultCorrelator::new());
        let metrics = Metrics::new().unwrap();
        let token = CancellationToken::new();
        let dispatcher = Arc::new(JobDispatcher::new(
            registry.clone(),
            mailboxes.clone(),
            correlator.clone(),
            Duration::from_secs(5),
            metrics.clone(),
            token.clone(),
        ));
        let service = DispatchService::new(
            registry.clone(),
            mailboxes.clone(),
            correlator.clone(),
            dispatcher,
            metrics,
            Duration::from_millis(50),
            token,
        );
        Fixture {
            service,
            registry,
            mailboxes,
            correlator,
        }
    }

    #[tokio::test]
    async fn test_submit_result_completes_waiter() {
        let fixture = make_service();
        let rx = fixture.correlator.register(42);

        let wire = dispatch::ResponseEnvelope {
            request_id: 42,
            kind: dispatch::JobKind::GetMailsFromUrls as i32,
            result: Some(dispatch::WebsiteBatch { websites: vec![] }),
            error: String::new(),
        };
        fixture
            .service
            .submit_result(Request::new(wire))
            .await
            .unwrap();

        let response = rx.await.unwrap();
        assert_eq!(response.request_id, 42);
        assert_eq!(response.kind, JobKind::GetMailsFromUrls);
    }

    #[tokio::test]
    async fn test_submit_result_acknowledges_late_result() {
        let fixture = make_service();
        let wire = dispatch::ResponseEnvelope {
            request_id: 7,
            kind: dispatch::JobKind::GetKeywordResults as i32,
            result: None,
            error: String::new(),
        };
        assert!(fixture.service.submit_result(Request::new(wire)).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_result_rejects_unspecified_kind() {
        let fixture = make_service();
        let wire = dispatch::ResponseEnvelope {
            request_id: 7,
            kind: dispatch::JobKind::Unspecified as i32,
            result: None,
            error: String::new(),
        };
        let status = fixture
            .service
            .submit_result(Request::new(wire))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_notify_exit_removes_slot_and_fails_queued_requests() {
        let fixture = make_service();
        fixture.registry.upsert("worker-1", 5);

        let envelope = RequestEnvelope::new(
            "worker-1",
            JobPayload::MailsFromUrls(vec!["https://example.com".to_string()]),
        );
        let rx = fixture.correlator.register(envelope.request_id);
        fixture.mailboxes.push(envelope);

        fixture
            .service
            .notify_exit(Request::new(ExitNotice {
                worker_id: "worker-1".to_string(),
            }))
            .await
            .unwrap();

        assert!(fixture.registry.get("worker-1").is_none());
        assert_eq!(fixture.mailboxes.total_pending(), 0);
        let response = rx.await.unwrap();
        assert!(response.into_result().is_err());
    }

    #[tokio::test]
    async fn test_notify_exit_requires_worker_id() {
        let fixture = make_service();
        let status = fixture
            .service
            .notify_exit(Request::new(ExitNotice {
                worker_id: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
