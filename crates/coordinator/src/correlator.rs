use dashmap::DashMap;
use mailhive_common::{HiveError, HiveResult, RequestId, ResponseEnvelope};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Matches each submitted response to the dispatch call waiting for it.
///
/// A request moves Pending -> Completed -> Delivered; the waiter removes its
/// entry on delivery and also when its deadline passes, so a late response for
/// a timed-out request finds nothing and is dropped.
#[derive(Default)]
pub struct ResultCorrelator {
    waiters: DashMap<RequestId, oneshot::Sender<ResponseEnvelope>>,
}

impl ResultCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `request_id`; the receiver resolves when its response arrives
    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<ResponseEnvelope> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(request_id, tx).is_some() {
            warn!(request_id = %request_id, "Request id registered twice, previous waiter dropped");
        }
        rx
    }

    /// Deliver a response to its waiter. Returns false for an unknown or expired id.
    pub fn complete(&self, response: ResponseEnvelope) -> bool {
        let request_id = response.request_id;
        match self.waiters.remove(&request_id) {
            Some((_, tx)) => {
                if tx.send(response).is_err() {
                    debug!(request_id = %request_id, "Waiter left before the response arrived");
                    return false;
                }
                true
            }
            None => {
                warn!(request_id = %request_id, "Dropping response for unknown or expired request");
                false
            }
        }
    }

    /// Wait for the response to `request_id` for at most `deadline`
    pub async fn await_result(
        &self,
        request_id: RequestId,
        rx: oneshot::Receiver<ResponseEnvelope>,
        deadline: Duration,
    ) -> HiveResult<ResponseEnvelope> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.cancel(request_id);
                Err(HiveError::Transport(format!(
                    "request {} was abandoned before a response arrived",
                    request_id
                )))
            }
            Err(_) => {
                self.cancel(request_id);
                Err(HiveError::Timeout(format!(
                    "no response to request {} within {:?}",
                    request_id, deadline
                )))
            }
        }
    }

    /// Forget `request_id`; its waiter, if still alive, sees a closed channel
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.waiters.remove(&request_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}
