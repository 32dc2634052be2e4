use mailhive_common::{
    append_unique, normalize_base_url, HiveError, HiveResult, JobKind, Website,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::browser::BrowserAction;
use crate::browser_pool::BrowserPool;
use crate::task_queue::Job;

/// Build mail jobs from raw URLs: one job per unique normalized base URL,
/// first occurrence wins.
pub fn jobs_from_urls(urls: &[String]) -> Vec<Job> {
    let mut seen = Vec::new();
    let mut jobs = Vec::new();

    for url in urls {
        let base_url = normalize_base_url(url);
        if !append_unique(&mut seen, base_url.as_str()) {
            continue;
        }
        jobs.push(Job {
            sequence_index: jobs.len(),
            kind: JobKind::GetMailsFromUrls,
            website: Website::new(&base_url),
        });
    }

    jobs
}

/// Build mail jobs from caller-supplied records, keeping their populated fields
pub fn jobs_from_websites(websites: Vec<Website>) -> Vec<Job> {
    let mut seen = Vec::new();
    let mut jobs = Vec::new();

    for mut website in websites {
        website.base_url = normalize_base_url(&website.base_url);
        if !append_unique(&mut seen, website.base_url.as_str()) {
            continue;
        }
        jobs.push(Job {
            sequence_index: jobs.len(),
            kind: JobKind::GetMailsFromWebsites,
            website,
        });
    }

    jobs
}

/// Splits a job batch across pooled browsers and gathers the results
pub struct JobOrchestrator {
    pool: Arc<BrowserPool>,
    max_tasks: usize,
    action: Arc<dyn BrowserAction>,
}

impl JobOrchestrator {
    pub fn new(pool: Arc<BrowserPool>, max_tasks: usize, action: Arc<dyn BrowserAction>) -> Self {
        Self {
            pool,
            max_tasks: max_tasks.max(1),
            action,
        }
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Jobs this worker can take right now: idle browsers times jobs per browser
    pub fn free_capacity(&self) -> usize {
        self.pool.idle_count() * self.max_tasks
    }

    /// Check capacity, then run the batch. Fails fast without touching the
    /// pool when the batch is larger than the free capacity.
    pub async fn execute(&self, jobs: Vec<Job>) -> HiveResult<Vec<Website>> {
        let free_capacity = self.free_capacity();
        if jobs.len() > free_capacity {
            return Err(HiveError::Capacity(format!(
                "batch of {} job(s) exceeds free capacity {}",
                jobs.len(),
                free_capacity
            )));
        }

        self.run_chunks(jobs).await
    }

    /// Partition into chunks of `max_tasks`, loan one browser per chunk
    /// concurrently, and aggregate.
    ///
    /// A chunk that cannot loan a browser fails the whole batch once every
    /// other chunk has finished and released its browser.
    pub async fn run_chunks(&self, jobs: Vec<Job>) -> HiveResult<Vec<Website>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let total_jobs = jobs.len();
        let aggregate = Arc::new(Mutex::new(Vec::with_capacity(total_jobs)));
        let mut join_set = JoinSet::new();

        let mut chunk_index = 0;
        let mut remaining = jobs.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<Job> = remaining.by_ref().take(self.max_tasks).collect();
            let pool = self.pool.clone();
            let action = self.action.clone();
            let aggregate = aggregate.clone();

            join_set.spawn(async move {
                let resource = pool.loan().await.map_err(|e| {
                    warn!(chunk = chunk_index, "Chunk could not loan a browser: {}", e);
                    e
                })?;

                let websites = resource.run_batch(chunk, action).await;
                aggregate.lock().await.extend(websites);

                if let Err(e) = pool.release(resource).await {
                    warn!(chunk = chunk_index, "Failed to release browser: {}", e);
                }
                Ok::<(), HiveError>(())
            });
            chunk_index += 1;
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined
                .map_err(|e| HiveError::Capacity(format!("chunk task failed: {}", e)))
                .and_then(|result| result);
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let websites = std::mem::take(&mut *aggregate.lock().await);
        info!(
            "Batch of {} job(s) finished across {} chunk(s)",
            total_jobs, chunk_index
        );
        Ok(websites)
    }
}
