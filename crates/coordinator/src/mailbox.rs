use dashmap::DashMap;
use mailhive_common::{RequestEnvelope, RequestId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Pending requests addressed to one worker
#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<RequestEnvelope>>,
    notify: Notify,
}

impl Mailbox {
    fn push_back(&self, envelope: RequestEnvelope) {
        self.lock().push_back(envelope);
        self.notify.notify_one();
    }

    fn push_front(&self, envelope: RequestEnvelope) {
        self.lock().push_front(envelope);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<RequestEnvelope> {
        self.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn drain(&self) -> Vec<RequestEnvelope> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RequestEnvelope>> {
        // The queue holds plain data, a poisoned lock still has a usable deque
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One FIFO per worker id. A poll from worker X only ever dequeues from X's mailbox.
#[derive(Default)]
pub struct Mailboxes {
    boxes: DashMap<String, Arc<Mailbox>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, worker_id: &str) -> Arc<Mailbox> {
        self.boxes
            .entry(worker_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Queue a request for its addressed worker
    pub fn push(&self, envelope: RequestEnvelope) {
        debug!(
            request_id = %envelope.request_id,
            worker_id = %envelope.addressed_worker_id,
            "Request queued"
        );
        self.mailbox(&envelope.addressed_worker_id).push_back(envelope);
    }

    /// Put back a request whose delivery failed so the next poll gets it first.
    ///
    /// A mailbox dropped by [`Mailboxes::remove`] is not re-created; the
    /// envelope comes back as `Err` so the caller can fail it instead.
    pub fn push_front(&self, envelope: RequestEnvelope) -> Result<(), RequestEnvelope> {
        let Some(mailbox) = self
            .boxes
            .get(&envelope.addressed_worker_id)
            .map(|entry| entry.value().clone())
        else {
            return Err(envelope);
        };

        warn!(
            request_id = %envelope.request_id,
            worker_id = %envelope.addressed_worker_id,
            "Request returned to mailbox after failed delivery"
        );
        mailbox.push_front(envelope);
        Ok(())
    }

    /// Take the next request for `worker_id`, waiting up to `window` for one to arrive
    pub async fn pop_wait(&self, worker_id: &str, window: Duration) -> Option<RequestEnvelope> {
        let mailbox = self.mailbox(worker_id);
        let deadline = tokio::time::Instant::now() + window;

        loop {
            // notify_one keeps a permit, so a push between the check and the wait still wakes us
            let notified = mailbox.notify.notified();
            if let Some(envelope) = mailbox.pop() {
                return Some(envelope);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return mailbox.pop();
            }
        }
    }

    /// Take back a request that no worker picked up yet. Returns false once it was delivered.
    pub fn withdraw(&self, worker_id: &str, request_id: RequestId) -> bool {
        let Some(mailbox) = self.boxes.get(worker_id) else {
            return false;
        };
        let mut queue = mailbox.lock();
        let before = queue.len();
        queue.retain(|envelope| envelope.request_id != request_id);
        queue.len() != before
    }

    pub fn pending(&self, worker_id: &str) -> usize {
        self.boxes.get(worker_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.boxes.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drop the mailbox of `worker_id`, returning whatever was still queued
    pub fn remove(&self, worker_id: &str) -> Vec<RequestEnvelope> {
        match self.boxes.remove(worker_id) {
            Some((_, mailbox)) => mailbox.drain(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhive_common::JobPayload;

    fn try_pop(mailboxes: &Mailboxes, worker_id: &str) -> Option<RequestEnvelope> {
        mailboxes.boxes.get(worker_id).and_then(|mailbox| mailbox.pop())
    }

    fn make_envelope(worker_id: &str) -> RequestEnvelope {
        RequestEnvelope::new(
            worker_id,
            JobPayload::MailsFromUrls(vec!["https://example.com".to_string()]),
        )
    }

    #[test]
    fn test_push_and_pop_are_fifo_per_worker() {
        let mailboxes = Mailboxes::new();
        let first = make_envelope("worker-1");
        let second = make_envelope("worker-1");
        mailboxes.push(first.clone());
        mailboxes.push(second.clone());

        assert_eq!(try_pop(&mailboxes, "worker-1"), Some(first));
        assert_eq!(try_pop(&mailboxes, "worker-1"), Some(second));
        assert_eq!(try_pop(&mailboxes, "worker-1"), None);
    }

    #[test]
    fn test_worker_never_receives_other_workers_requests() {
        let mailboxes = Mailboxes::new();
        mailboxes.push(make_envelope("worker-a"));

        assert_eq!(try_pop(&mailboxes, "worker-b"), None);
        assert_eq!(mailboxes.pending("worker-a"), 1);
        assert_eq!(mailboxes.total_pending(), 1);
    }

    #[test]
    fn test_push_front_jumps_the_queue() {
        let mailboxes = Mailboxes::new();
        let queued = make_envelope("worker-1");
        let returned = make_envelope("worker-1");
        mailboxes.push(queued.clone());
        mailboxes.push_front(returned.clone()).unwrap();

        assert_eq!(try_pop(&mailboxes, "worker-1"), Some(returned));
        assert_eq!(try_pop(&mailboxes, "worker-1"), Some(queued));
    }

    #[test]
    fn test_push_front_does_not_revive_removed_mailbox() {
        let mailboxes = Mailboxes::new();
        mailboxes.push(make_envelope("worker-1"));
        mailboxes.remove("worker-1");

        let returned = make_envelope("worker-1");
        assert_eq!(mailboxes.push_front(returned.clone()), Err(returned));
        assert_eq!(mailboxes.total_pending(), 0);
        assert!(mailboxes.boxes.get("worker-1").is_none());
    }

    #[test]
    fn test_remove_drains_pending_requests() {
        let mailboxes = Mailboxes::new();
        mailboxes.push(make_envelope("worker-1"));
        mailboxes.push(make_envelope("worker-1"));

        assert_eq!(mailboxes.remove("worker-1").len(), 2);
        assert_eq!(mailboxes.total_pending(), 0);
        assert!(mailboxes.remove("worker-1").is_empty());
    }

    #[test]
    fn test_withdraw_removes_only_undelivered_request() {
        let mailboxes = Mailboxes::new();
        let kept = make_envelope("worker-1");
        let withdrawn = make_envelope("worker-1");
        mailboxes.push(kept.clone());
        mailboxes.push(withdrawn.clone());

        assert!(mailboxes.withdraw("worker-1", withdrawn.request_id));
        assert!(!mailboxes.withdraw("worker-1", withdrawn.request_id));
        assert_eq!(try_pop(&mailboxes, "worker-1"), Some(kept));
        assert_eq!(mailboxes.total_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_wait_returns_none_after_window() {
        let mailboxes = Mailboxes::new();
        let started = tokio::time::Instant::now();

        assert!(mailboxes
            .pop_wait("worker-1", Duration::from_secs(1))
            .await
            .is_none());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let mailboxes = Arc::new(Mailboxes::new());
        let envelope = make_envelope("worker-1");

        let waiter = {
            let mailboxes = mailboxes.clone();
            tokio::spawn(async move { mailboxes.pop_wait("worker-1", Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailboxes.push(envelope.clone());

        let received = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake before the window ends")
            .unwrap();
        assert_eq!(received, Some(envelope));
    }
}
