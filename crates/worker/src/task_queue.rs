use mailhive_common::{JobKind, Website};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::browser::{BrowserAction, BrowserResource};

/// One unit of extraction work bound to a single website
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub sequence_index: usize,
    pub kind: JobKind,
    pub website: Website,
}

/// Bounded-concurrency runner owned by one [`BrowserResource`].
///
/// A batch is admitted job by job while fewer than `max_running` jobs are in
/// flight on the browser; the rest wait on a semaphore slot.
pub struct TaskQueue {
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    completed: AtomicU64,
}

/// Decrements the in-flight counter when a job finishes, even on panic
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskQueue {
    pub fn new(max_running: usize) -> Self {
        let max_running = max_running.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_running)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            completed: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs completed since the last reset
    #[cfg(test)]
    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.completed.store(0, Ordering::SeqCst);
    }

    /// Run every job exactly once and return one website per job, in
    /// completion order.
    ///
    /// A failing or timed-out action still counts as complete. An empty batch
    /// returns immediately.
    pub async fn run_batch(
        &self,
        resource: Arc<BrowserResource>,
        jobs: Vec<Job>,
        action: Arc<dyn BrowserAction>,
    ) -> Vec<Website> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let batch_size = jobs.len();
        let snapshots: Vec<Website> = jobs.iter().map(|job| job.website.clone()).collect();
        let mut finished = vec![false; batch_size];
        let mut results = Vec::with_capacity(batch_size);
        let mut join_set = JoinSet::new();

        for (slot, job) in jobs.into_iter().enumerate() {
            let slots = self.slots.clone();
            let in_flight = self.in_flight.clone();
            let resource = resource.clone();
            let action = action.clone();

            join_set.spawn(async move {
                // The semaphore is never closed, so acquire only fails if it were
                let _permit = slots.acquire_owned().await.ok();
                let _guard = InFlightGuard::new(in_flight);
                let website = resource.run_job(action, job.website).await;
                (slot, website)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((slot, website)) => {
                    finished[slot] = true;
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    results.push(website);
                }
                Err(e) => {
                    warn!(browser_id = resource.id(), "Job task failed: {}", e);
                }
            }
        }

        // Panicked tasks still owe the batch one website each
        for (slot, done) in finished.iter().enumerate() {
            if !done {
                self.completed.fetch_add(1, Ordering::SeqCst);
                let mut website = snapshots[slot].clone();
                website.timed_out = true;
                results.push(website);
            }
        }

        debug!(
            browser_id = resource.id(),
            "Batch of {} job(s) completed",
            batch_size
        );

        results
    }
}
