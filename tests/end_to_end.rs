//! Coordinator and worker talking over a real gRPC connection on localhost,
//! with an in-memory browser engine in place of Chrome.

use anyhow::Result;
use mailhive::common::{
    CoordinatorConfig, HiveError, JobPayload, PoolConfig, QueueConfig, SearchDomain, Website,
    WorkerConfig,
};
use mailhive::coordinator::Coordinator;
use mailhive::worker::{
    serve_worker, BrowserEngine, BrowserPage, BrowserPool, ExtractMails, KeywordSearch, Metrics,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LANDING: &str = r#"<html><head><title>Example</title></head>
<body><a href="/contact">Contact us</a></body></html>"#;

const CONTACT: &str = r#"<html><body>
<p>Write to contact@example.com</p>
<a href="https://twitter.com/example">Twitter</a>
</body></html>"#;

/// Serves canned HTML by URL; unknown URLs get an empty page
struct StaticPage {
    pages: Arc<HashMap<String, String>>,
    current: Mutex<String>,
}

impl BrowserPage for StaticPage {
    fn navigate(&self, url: &str) -> Result<()> {
        if let Ok(mut current) = self.current.lock() {
            *current = url.to_string();
        }
        Ok(())
    }

    fn content(&self) -> Result<String> {
        let current = self.current.lock().map(|c| c.clone()).unwrap_or_default();
        Ok(self.pages.get(&current).cloned().unwrap_or_default())
    }

    fn close(&self) {}
}

struct StaticEngine {
    pages: Arc<HashMap<String, String>>,
}

impl StaticEngine {
    fn new() -> Self {
        let mut pages = HashMap::new();
        pages.insert("https://example.com".to_string(), LANDING.to_string());
        pages.insert("https://example.com/contact".to_string(), CONTACT.to_string());
        Self {
            pages: Arc::new(pages),
        }
    }
}

impl BrowserEngine for StaticEngine {
    fn name(&self) -> &str {
        "static"
    }

    fn open_page(&self) -> Result<Arc<dyn BrowserPage>> {
        Ok(Arc::new(StaticPage {
            pages: self.pages.clone(),
            current: Mutex::new(String::new()),
        }))
    }

    fn close_all_pages(&self) {}
}

struct StaticSearch;

#[tonic::async_trait]
impl KeywordSearch for StaticSearch {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, keyword: &str, _page_count: u32, domain: SearchDomain) -> Result<Vec<Website>> {
        let mut website = Website::new("https://example.com/some/result");
        website.title = format!("{} on {}", keyword, domain.domain());
        Ok(vec![website])
    }
}

struct Cluster {
    coordinator_token: CancellationToken,
    worker_token: CancellationToken,
    dispatcher: Arc<mailhive::coordinator::JobDispatcher>,
    registry: Arc<mailhive::coordinator::WorkerRegistry>,
    coordinator: JoinHandle<Result<()>>,
    worker: JoinHandle<Result<()>>,
}

const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        result_timeout: RESULT_TIMEOUT,
        poll_window: Duration::from_millis(100),
        announce_interval: Duration::from_millis(50),
        stale_after_missed: 20,
        enable_metrics: false,
        ..Default::default()
    }
}

async fn start_coordinator(
    token: CancellationToken,
) -> (Coordinator, TcpListener, TcpListener, SocketAddr) {
    let coordinator = Coordinator::new(coordinator_config(), token).unwrap();
    let grpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let grpc_addr = grpc_listener.local_addr().unwrap();
    (coordinator, grpc_listener, http_listener, grpc_addr)
}

/// Coordinator plus one worker with one browser and five jobs per browser
async fn start_cluster() -> Cluster {
    let coordinator_token = CancellationToken::new();
    let (coordinator, grpc_listener, http_listener, grpc_addr) =
        start_coordinator(coordinator_token.clone()).await;
    let dispatcher = coordinator.dispatcher();
    let registry = coordinator.registry();
    let coordinator = tokio::spawn(coordinator.serve(grpc_listener, http_listener));

    let config = WorkerConfig {
        worker_id: "e2e-worker".to_string(),
        coordinator_endpoint: format!("http://{}", grpc_addr),
        pool: PoolConfig {
            capacity: 1,
            loan_timeout: Duration::from_secs(1),
        },
        queue: QueueConfig {
            max_tasks: 5,
            max_running: 3,
            job_timeout: Duration::from_secs(5),
        },
        status_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let engines: Vec<Arc<dyn BrowserEngine>> = vec![Arc::new(StaticEngine::new())];
    let pool = BrowserPool::new(
        engines,
        config.queue.job_timeout,
        config.queue.max_running,
        config.pool.loan_timeout,
    )
    .unwrap();

    let worker_token = CancellationToken::new();
    let worker = tokio::spawn(serve_worker(
        config,
        Arc::new(pool),
        Arc::new(ExtractMails),
        Some(Arc::new(StaticSearch)),
        Metrics::new("e2e-worker").unwrap(),
        worker_token.clone(),
    ));

    Cluster {
        coordinator_token,
        worker_token,
        dispatcher,
        registry,
        coordinator,
        worker,
    }
}

async fn wait_for_capacity(registry: &mailhive::coordinator::WorkerRegistry, capacity: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if registry.max_fresh_capacity() >= capacity {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("worker should announce its capacity");
}

async fn stop_cluster(cluster: Cluster) {
    cluster.worker_token.cancel();
    tokio::time::timeout(Duration::from_secs(10), cluster.worker)
        .await
        .expect("worker should stop")
        .unwrap()
        .unwrap();

    cluster.coordinator_token.cancel();
    tokio::time::timeout(Duration::from_secs(10), cluster.coordinator)
        .await
        .expect("coordinator should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_urls_collapse_into_one_website() {
    let cluster = start_cluster().await;
    wait_for_capacity(&cluster.registry, 5).await;

    let websites = cluster
        .dispatcher
        .dispatch(JobPayload::MailsFromUrls(vec![
            "https://example.com/".to_string(),
            "https://example.com/about".to_string(),
        ]))
        .await
        .unwrap();

    assert_eq!(websites.len(), 1);
    let website = &websites[0];
    assert_eq!(website.base_url, "https://example.com");
    assert_eq!(website.title, "Example");
    assert_eq!(website.mails, vec!["contact@example.com"]);
    assert_eq!(website.paths, vec!["https://example.com/contact"]);
    assert_eq!(website.socials, vec!["https://twitter.com/example"]);
    assert!(!website.timed_out);

    stop_cluster(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keyword_request_round_trips_through_worker() {
    let cluster = start_cluster().await;
    wait_for_capacity(&cluster.registry, 1).await;

    let websites = cluster
        .dispatcher
        .dispatch(JobPayload::KeywordResults {
            keyword: "plombier".to_string(),
            page_count: 1,
            search_domain: "google.es".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(websites.len(), 1);
    assert_eq!(websites[0].base_url, "https://example.com");
    assert_eq!(websites[0].title, "plombier on google.es");

    stop_cluster(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_above_announced_capacity_is_refused() {
    let cluster = start_cluster().await;
    wait_for_capacity(&cluster.registry, 5).await;

    let urls = (0..6).map(|i| format!("https://site{}.com", i)).collect();
    let err = cluster
        .dispatcher
        .dispatch(JobPayload::MailsFromUrls(urls))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::Capacity(_)));

    stop_cluster(cluster).await;
}

#[tokio::test]
async fn test_dispatch_without_workers_fails_fast_and_queues_nothing() {
    let token = CancellationToken::new();
    let (coordinator, _grpc_listener, _http_listener, _) = start_coordinator(token).await;

    let started = std::time::Instant::now();
    let err = coordinator
        .dispatcher()
        .dispatch(JobPayload::MailsFromUrls(vec!["https://example.com".to_string()]))
        .await
        .unwrap_err();

    assert!(matches!(err, HiveError::Capacity(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(coordinator.mailboxes().total_pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_exit_removes_it_from_registry() {
    let cluster = start_cluster().await;
    wait_for_capacity(&cluster.registry, 5).await;
    assert!(cluster.registry.get("e2e-worker").is_some());

    cluster.worker_token.cancel();
    tokio::time::timeout(Duration::from_secs(10), cluster.worker)
        .await
        .expect("worker should stop")
        .unwrap()
        .unwrap();

    assert!(cluster.registry.get("e2e-worker").is_none());

    cluster.coordinator_token.cancel();
    tokio::time::timeout(Duration::from_secs(10), cluster.coordinator)
        .await
        .expect("coordinator should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_dispatched_during_worker_shutdown_is_answered() {
    for _ in 0..3 {
        let cluster = start_cluster().await;
        wait_for_capacity(&cluster.registry, 5).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        cluster.worker_token.cancel();
        let started = std::time::Instant::now();
        let outcome = cluster
            .dispatcher
            .dispatch(JobPayload::MailsFromUrls(vec!["https://example.com".to_string()]))
            .await;

        // Either the draining worker ran it, or it was failed once the worker left
        assert!(
            !matches!(outcome, Err(HiveError::Timeout(_))),
            "request was lost: {:?}",
            outcome
        );
        assert!(started.elapsed() < RESULT_TIMEOUT);

        tokio::time::timeout(Duration::from_secs(10), cluster.worker)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();
        cluster.coordinator_token.cancel();
        tokio::time::timeout(Duration::from_secs(10), cluster.coordinator)
            .await
            .expect("coordinator should stop")
            .unwrap()
            .unwrap();
    }
}
