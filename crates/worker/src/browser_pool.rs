use anyhow::Result;
use mailhive_common::{HiveError, HiveResult, WorkerConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::browser::{BrowserEngine, BrowserResource, HeadlessChromeEngine};

/// Fixed-size pool of browser resources with exclusive loan/return.
///
/// `idle` holds the resources nobody has loaned; `available` carries one
/// permit per entry in `idle`, so a loan waits on the semaphore instead of
/// polling the set.
pub struct BrowserPool {
    resources: Vec<Arc<BrowserResource>>,
    idle: Mutex<VecDeque<Arc<BrowserResource>>>,
    available: Semaphore,
    idle_count: AtomicUsize,
    active_count: AtomicUsize,
    loan_timeout: Duration,
}

impl BrowserPool {
    /// Build a pool with one resource per engine
    pub fn new(
        engines: Vec<Arc<dyn BrowserEngine>>,
        job_timeout: Duration,
        max_running: usize,
        loan_timeout: Duration,
    ) -> Result<Self> {
        if engines.is_empty() {
            anyhow::bail!("Browser pool needs at least one engine");
        }

        let resources: Vec<Arc<BrowserResource>> = engines
            .into_iter()
            .enumerate()
            .map(|(id, engine)| {
                Arc::new(BrowserResource::new(id, engine, job_timeout, max_running))
            })
            .collect();
        let capacity = resources.len();

        Ok(Self {
            idle: Mutex::new(resources.iter().cloned().collect()),
            resources,
            available: Semaphore::new(capacity),
            idle_count: AtomicUsize::new(capacity),
            active_count: AtomicUsize::new(0),
            loan_timeout,
        })
    }

    /// Launch one Chrome process per configured pool slot
    pub async fn launch(config: &WorkerConfig) -> Result<Self> {
        info!(
            "Launching {} Chrome process(es) (headless: {}, no_sandbox: {})",
            config.pool.capacity, config.browser.headless, config.browser.no_sandbox
        );

        let mut engines: Vec<Arc<dyn BrowserEngine>> = Vec::with_capacity(config.pool.capacity);
        for _ in 0..config.pool.capacity {
            let browser_config = config.browser.clone();
            let engine = tokio::task::spawn_blocking(move || {
                HeadlessChromeEngine::launch(&browser_config)
            })
            .await??;
            engines.push(Arc::new(engine));
        }

        info!("Browser processes launched successfully");

        Self::new(
            engines,
            config.queue.job_timeout,
            config.queue.max_running,
            config.pool.loan_timeout,
        )
    }

    pub fn capacity(&self) -> usize {
        self.resources.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Take an idle resource, waiting at most the configured loan timeout
    pub async fn loan(&self) -> HiveResult<Arc<BrowserResource>> {
        let permit = tokio::time::timeout(self.loan_timeout, self.available.acquire())
            .await
            .map_err(|_| {
                HiveError::Capacity(format!(
                    "no idle browser within {:?} ({} active)",
                    self.loan_timeout,
                    self.active_count()
                ))
            })?
            .map_err(|_| HiveError::Shutdown)?;

        // An error below drops the permit, which returns it to the semaphore
        let resource = {
            let mut idle = self
                .idle
                .lock()
                .map_err(|_| HiveError::Capacity("browser pool lock poisoned".to_string()))?;
            let resource = idle.pop_front().ok_or_else(|| {
                HiveError::Capacity("idle set empty despite available permit".to_string())
            })?;
            self.idle_count.fetch_sub(1, Ordering::SeqCst);
            self.active_count.fetch_add(1, Ordering::SeqCst);
            resource
        };
        // Handed back by `release`
        permit.forget();

        if !resource.mark_loaned() {
            warn!(browser_id = resource.id(), "Idle browser was already marked as loaned");
        }
        debug!(browser_id = resource.id(), "Browser loaned");
        Ok(resource)
    }

    /// Reset a loaned resource and put it back into the idle set
    pub async fn release(&self, resource: Arc<BrowserResource>) -> HiveResult<()> {
        if !resource.is_loaned() {
            return Err(HiveError::InvalidRequest(format!(
                "browser {} released without an outstanding loan",
                resource.id()
            )));
        }

        let to_reset = resource.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || to_reset.reset()).await {
            warn!(browser_id = resource.id(), "Browser reset task failed: {}", e);
        }

        {
            let mut idle = self
                .idle
                .lock()
                .map_err(|_| HiveError::Capacity("browser pool lock poisoned".to_string()))?;
            if !resource.mark_returned() {
                // A concurrent release won the race
                return Err(HiveError::InvalidRequest(format!(
                    "browser {} released twice",
                    resource.id()
                )));
            }
            idle.push_back(resource.clone());
            self.active_count.fetch_sub(1, Ordering::SeqCst);
            self.idle_count.fetch_add(1, Ordering::SeqCst);
        }
        self.available.add_permits(1);

        debug!(browser_id = resource.id(), "Browser released");
        Ok(())
    }

    /// Close every page on every browser
    pub async fn shutdown(&self) {
        self.available.close();
        let resources = self.resources.clone();
        let _ = tokio::task::spawn_blocking(move || {
            for resource in resources {
                resource.reset();
            }
        })
        .await;
        info!("Browser pool shut down");
    }
}
