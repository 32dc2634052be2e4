use anyhow::Result;
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use mailhive_common::{BrowserConfig, Website};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::task_queue::{Job, TaskQueue};

/// One isolated page (tab) opened by a [`BrowserEngine`].
///
/// All methods block on the browser's devtools connection; call them from
/// `spawn_blocking`, never directly on the async runtime.
pub trait BrowserPage: Send + Sync {
    fn navigate(&self, url: &str) -> Result<()>;

    fn content(&self) -> Result<String>;

    /// Close the page. Aborts any call still blocked on it.
    fn close(&self);
}

/// A controllable browser instance capable of opening isolated pages
pub trait BrowserEngine: Send + Sync {
    fn name(&self) -> &str;

    fn open_page(&self) -> Result<Arc<dyn BrowserPage>>;

    /// Close every page still open on this engine
    fn close_all_pages(&self);
}

/// Extraction step run against one page for one website.
///
/// Errors are logged by the caller and never abort sibling jobs.
pub trait BrowserAction: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, page: &dyn BrowserPage, website: &mut Website) -> Result<()>;
}

pub struct ChromePage {
    tab: Arc<Tab>,
}

impl BrowserPage for ChromePage {
    fn navigate(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Navigation to {} failed: {}", url, e))
    }

    fn content(&self) -> Result<String> {
        self.tab
            .get_content()
            .map_err(|e| anyhow::anyhow!("Failed to read page content: {}", e))
    }

    fn close(&self) {
        let _ = self.tab.close(false);
    }
}

/// headless_chrome-backed engine: one Chrome process, one incognito
/// browser context per page so cookies never leak between jobs
pub struct HeadlessChromeEngine {
    browser: Browser,
    open_tabs: Mutex<Vec<Arc<Tab>>>,
}

impl HeadlessChromeEngine {
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        let mut launch_builder = LaunchOptions::default_builder();
        launch_builder
            .headless(config.headless)
            .sandbox(!config.no_sandbox)
            // Default is 30 seconds which closes the websocket between batches
            .idle_browser_timeout(Duration::from_secs(3600));

        if let Some(ref browser_path) = config.browser_path {
            info!("Using custom browser binary: {}", browser_path.display());
            launch_builder.path(Some(browser_path.clone()));
        }

        let launch_options = launch_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build launch options: {}", e))?;

        let browser = Browser::new(launch_options).map_err(|e| {
            tracing::error!(
                "Browser failed to launch: {}. Check the binary path and, inside containers, WORKER_NO_SANDBOX",
                e
            );
            e
        })?;

        Ok(Self {
            browser,
            open_tabs: Mutex::new(Vec::new()),
        })
    }
}

impl BrowserEngine for HeadlessChromeEngine {
    fn name(&self) -> &str {
        "headless_chrome"
    }

    fn open_page(&self) -> Result<Arc<dyn BrowserPage>> {
        // Chrome disposes the incognito context once its last tab closes
        let context = self
            .browser
            .new_context()
            .map_err(|e| anyhow::anyhow!("Failed to create isolated context: {}", e))?;
        let tab = context
            .new_tab()
            .map_err(|e| anyhow::anyhow!("Failed to create tab in isolated context: {}", e))?;

        if let Ok(mut tabs) = self.open_tabs.lock() {
            tabs.push(tab.clone());
        }

        Ok(Arc::new(ChromePage { tab }))
    }

    fn close_all_pages(&self) {
        let tabs = match self.open_tabs.lock() {
            Ok(mut tabs) => std::mem::take(&mut *tabs),
            Err(_) => return,
        };
        for tab in tabs {
            let _ = tab.close(false);
        }
    }
}

/// One browser engine plus the queue that runs jobs against it
pub struct BrowserResource {
    id: usize,
    engine: Arc<dyn BrowserEngine>,
    job_timeout: Duration,
    queue: TaskQueue,
    is_loaned: AtomicBool,
}

impl BrowserResource {
    pub fn new(
        id: usize,
        engine: Arc<dyn BrowserEngine>,
        job_timeout: Duration,
        max_running: usize,
    ) -> Self {
        Self {
            id,
            engine,
            job_timeout,
            queue: TaskQueue::new(max_running),
            is_loaned: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_loaned(&self) -> bool {
        self.is_loaned.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Flip idle -> loaned. False if it was already loaned.
    pub(crate) fn mark_loaned(&self) -> bool {
        self.is_loaned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flip loaned -> idle. False if it was not loaned.
    pub(crate) fn mark_returned(&self) -> bool {
        self.is_loaned
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Close pages left open by the previous loan
    pub(crate) fn reset(&self) {
        self.engine.close_all_pages();
        self.queue.reset();
    }

    /// Run a chunk of jobs through this resource's queue
    pub async fn run_batch(
        self: &Arc<Self>,
        jobs: Vec<Job>,
        action: Arc<dyn BrowserAction>,
    ) -> Vec<Website> {
        self.queue.run_batch(self.clone(), jobs, action).await
    }

    /// Execute one job on a fresh page under the per-job wall-clock timeout.
    ///
    /// Always yields a website: on timeout the page is force-closed and the
    /// pre-job snapshot comes back with `timed_out` set. A panicking action
    /// yields the snapshot the same way.
    pub async fn run_job(&self, action: Arc<dyn BrowserAction>, website: Website) -> Website {
        let start_time = Instant::now();
        let snapshot = website.clone();
        let base_url = website.base_url.clone();

        let engine = self.engine.clone();
        let page = match tokio::task::spawn_blocking(move || engine.open_page()).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                warn!(browser_id = self.id, base_url = %base_url, "Failed to open page: {}", e);
                return snapshot;
            }
            Err(e) => {
                warn!(browser_id = self.id, base_url = %base_url, "Page open task failed: {}", e);
                return snapshot;
            }
        };

        let page_for_abort = page.clone(); // Keep reference for forced close on timeout
        let action_name = action.name().to_string();
        let action_handle = tokio::task::spawn_blocking(move || {
            let mut website = website;
            let result = action.run(page.as_ref(), &mut website);
            page.close();
            (website, result)
        });

        tokio::select! {
            _ = tokio::time::sleep(self.job_timeout) => {
                warn!(
                    browser_id = self.id,
                    base_url = %base_url,
                    "Action {} hard timeout after {:?} - closing page to abort",
                    action_name,
                    self.job_timeout
                );
                page_for_abort.close();
                let mut website = snapshot;
                website.timed_out = true;
                website
            }
            result = action_handle => {
                match result {
                    Ok((website, Ok(()))) => {
                        debug!(
                            browser_id = self.id,
                            base_url = %base_url,
                            "Action {} finished in {}ms",
                            action_name,
                            start_time.elapsed().as_millis()
                        );
                        website
                    }
                    Ok((website, Err(e))) => {
                        warn!(browser_id = self.id, base_url = %base_url, "Action {} failed: {}", action_name, e);
                        website
                    }
                    Err(e) => {
                        // Join error - blocking task panicked
                        warn!(browser_id = self.id, base_url = %base_url, "Action {} task failed: {}", action_name, e);
                        page_for_abort.close();
                        let mut website = snapshot;
                        website.timed_out = true;
                        website
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BrowserResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserResource")
            .field("id", &self.id)
            .field("engine", &self.engine.name())
            .field("job_timeout", &self.job_timeout)
            .field("is_loaned", &self.is_loaned())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// In-memory page serving canned HTML per URL
    pub struct FakePage {
        pages: Arc<std::collections::HashMap<String, String>>,
        current: Mutex<Option<String>>,
        closed: Arc<AtomicUsize>,
    }

    impl BrowserPage for FakePage {
        fn navigate(&self, url: &str) -> Result<()> {
            if !self.pages.contains_key(url) {
                anyhow::bail!("404 for {}", url);
            }
            *self.current.lock().unwrap() = Some(url.to_string());
            Ok(())
        }

        fn content(&self) -> Result<String> {
            let current = self.current.lock().unwrap();
            let url = current.as_ref().ok_or_else(|| anyhow::anyhow!("no page loaded"))?;
            Ok(self.pages[url].clone())
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct FakeEngine {
        pub pages: Arc<std::collections::HashMap<String, String>>,
        pub opened: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
        pub close_all_calls: AtomicUsize,
    }

    impl FakeEngine {
        pub fn with_pages(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: Arc::new(
                    pages
                        .iter()
                        .map(|(url, html)| (url.to_string(), html.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }
        }
    }

    impl BrowserEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        fn open_page(&self) -> Result<Arc<dyn BrowserPage>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakePage {
                pages: self.pages.clone(),
                current: Mutex::new(None),
                closed: self.closed.clone(),
            }))
        }

        fn close_all_pages(&self) {
            self.close_all_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Action that panics on every website
    pub struct PanicAction;

    impl BrowserAction for PanicAction {
        fn name(&self) -> &str {
            "panic"
        }

        fn run(&self, _page: &dyn BrowserPage, _website: &mut Website) -> Result<()> {
            panic!("action crashed");
        }
    }

    /// Action that sleeps, records the title, and optionally fails
    pub struct SleepAction {
        pub delay: Duration,
        pub fail_for: Option<String>,
        pub running: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
    }

    impl SleepAction {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_for: None,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl BrowserAction for SleepAction {
        fn name(&self) -> &str {
            "sleep"
        }

        fn run(&self, _page: &dyn BrowserPage, website: &mut Website) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);

            website.title = format!("visited {}", website.base_url);
            if self.fail_for.as_deref() == Some(website.base_url.as_str()) {
                anyhow::bail!("extraction failed");
            }
            Ok(())
        }
    }
}
