use mailhive_common::{
    HiveError, HiveResult, JobPayload, RequestEnvelope, RequestId, ResponseEnvelope, Website,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlator::ResultCorrelator;
use crate::mailbox::Mailboxes;
use crate::metrics::Metrics;
use crate::registry::WorkerRegistry;

/// Reason attached to requests failed because their worker announced exit
pub const WORKER_EXITED: &str = "worker exited";

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

/// Takes a queued request back when its dispatch call ends early.
///
/// Dropped on every exit from `dispatch`, including when the caller drops
/// the future. Both calls are no-ops once the request was delivered and
/// answered.
struct PendingRequest<'a> {
    mailboxes: &'a Mailboxes,
    correlator: &'a ResultCorrelator,
    worker_id: String,
    request_id: RequestId,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.mailboxes.withdraw(&self.worker_id, self.request_id) {
            debug!(request_id = %self.request_id, "Withdrew request no worker picked up");
        }
        self.correlator.cancel(self.request_id);
    }
}

/// Routes a payload to one worker and waits for that worker's single response
pub struct JobDispatcher {
    registry: Arc<WorkerRegistry>,
    mailboxes: Arc<Mailboxes>,
    correlator: Arc<ResultCorrelator>,
    result_timeout: Duration,
    metrics: Metrics,
    cancellation_token: CancellationToken,
    active_requests: Arc<AtomicUsize>,
}

impl JobDispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        mailboxes: Arc<Mailboxes>,
        correlator: Arc<ResultCorrelator>,
        result_timeout: Duration,
        metrics: Metrics,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            mailboxes,
            correlator,
            result_timeout,
            metrics,
            cancellation_token,
            active_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Dispatch calls still waiting for their worker, for shutdown draining
    pub fn active_requests(&self) -> Arc<AtomicUsize> {
        self.active_requests.clone()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Dispatch `payload` and return the worker's websites.
    ///
    /// Fails with `Capacity` without queuing anything when no fresh worker
    /// announced enough free capacity, with `Timeout` when the worker does not
    /// answer within the result timeout, and with `Remote` when it answers with
    /// an error. Once shutdown starts new calls get `Shutdown`; calls already
    /// waiting keep their deadline.
    pub async fn dispatch(&self, payload: JobPayload) -> HiveResult<Vec<Website>> {
        let _active_guard = ActiveRequestGuard::new(self.active_requests.clone());
        let result = self.dispatch_inner(payload).await;
        if let Err(e) = &result {
            self.metrics.record_failure(e.reason());
        }
        self.metrics
            .pending_requests
            .set(self.correlator.pending_count() as i64);
        result
    }

    async fn dispatch_inner(&self, payload: JobPayload) -> HiveResult<Vec<Website>> {
        if self.cancellation_token.is_cancelled() {
            return Err(HiveError::Shutdown);
        }

        let kind = payload.kind();
        let required = payload.required_capacity();
        let worker_id = self.registry.reserve(required).map_err(|e| {
            warn!("Rejecting {} request needing {} slot(s): {}", kind, required, e);
            e
        })?;

        let envelope = RequestEnvelope::new(worker_id.clone(), payload);
        let request_id = envelope.request_id;
        info!(
            request_id = %request_id,
            worker_id = %worker_id,
            "Dispatching {} request ({} slot(s))",
            kind,
            required
        );

        // Register before queuing so an instant answer always finds its waiter
        let rx = self.correlator.register(request_id);
        let _pending = PendingRequest {
            mailboxes: &self.mailboxes,
            correlator: &self.correlator,
            worker_id: worker_id.clone(),
            request_id,
        };
        self.metrics
            .pending_requests
            .set(self.correlator.pending_count() as i64);
        self.mailboxes.push(envelope);

        // The worker may have announced exit between reserve and push, after
        // its queued requests were already failed
        if self.registry.get(&worker_id).is_none()
            && self.mailboxes.withdraw(&worker_id, request_id)
        {
            warn!(request_id = %request_id, worker_id = %worker_id, "Worker exited before the request was queued");
            return Err(HiveError::Remote(WORKER_EXITED.to_string()));
        }

        let response = self
            .correlator
            .await_result(request_id, rx, self.result_timeout)
            .await
            .map_err(|e| {
                warn!(request_id = %request_id, worker_id = %worker_id, "Request failed: {}", e);
                e
            })?;

        if response.kind != kind {
            return Err(HiveError::ProtocolMismatch(format!(
                "request {} was {} but the response is {}",
                request_id, kind, response.kind
            )));
        }

        let websites = response.into_result()?;
        debug!(
            request_id = %request_id,
            "Request delivered with {} website(s)",
            websites.len()
        );
        Ok(websites)
    }

    /// Fail every request still queued for `worker_id` so its waiters return.
    /// Returns how many were failed.
    pub fn fail_queued(&self, worker_id: &str) -> usize {
        let queued = self.mailboxes.remove(worker_id);
        let count = queued.len();

        for envelope in queued {
            self.fail_request(envelope);
        }

        if count > 0 {
            warn!(worker_id = %worker_id, "Failed {} queued request(s) after worker exit", count);
        }
        count
    }

    /// Handle a request popped for a worker that could not be reached.
    ///
    /// Requeued at the front while the worker is registered, failed with
    /// `worker exited` once it is gone.
    pub fn return_undelivered(&self, envelope: RequestEnvelope) {
        if self.registry.get(&envelope.addressed_worker_id).is_none() {
            self.fail_request(envelope);
            return;
        }
        if let Err(envelope) = self.mailboxes.push_front(envelope) {
            self.fail_request(envelope);
        }
    }

    fn fail_request(&self, envelope: RequestEnvelope) {
        let response = ResponseEnvelope::failure(envelope.request_id, envelope.kind(), WORKER_EXITED);
        self.correlator.complete(response);
    }
}
