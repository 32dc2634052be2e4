use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    worker_id: String,
    pub idle_browsers: IntGaugeVec,
    pub active_browsers: IntGaugeVec,
    pub free_capacity: IntGaugeVec,
    pub jobs_total: IntGaugeVec,
    pub jobs_timed_out: IntGaugeVec,
    pub requests_failed: IntGaugeVec,
}

impl Metrics {
    pub fn new(worker_id: &str) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let idle_browsers = IntGaugeVec::new(
            Opts::new(
                "mailhive_worker_idle_browsers",
                "Number of browsers waiting for a loan",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(idle_browsers.clone()))?;

        let active_browsers = IntGaugeVec::new(
            Opts::new(
                "mailhive_worker_active_browsers",
                "Number of browsers currently loaned to a batch",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(active_browsers.clone()))?;

        // What the status loop last announced
        let free_capacity = IntGaugeVec::new(
            Opts::new(
                "mailhive_worker_free_capacity",
                "Jobs this worker can accept right now",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(free_capacity.clone()))?;

        let jobs_total = IntGaugeVec::new(
            Opts::new(
                "mailhive_worker_jobs_total",
                "Total number of website jobs executed",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let jobs_timed_out = IntGaugeVec::new(
            Opts::new(
                "mailhive_worker_jobs_timed_out",
                "Website jobs that hit the per-job timeout",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(jobs_timed_out.clone()))?;

        let requests_failed = IntGaugeVec::new(
            Opts::new(
                "mailhive_worker_requests_failed",
                "Dispatched requests answered with an error",
            ),
            &["worker"],
        )?;
        registry.register(Box::new(requests_failed.clone()))?;

        for gauge in [
            &idle_browsers,
            &active_browsers,
            &free_capacity,
            &jobs_total,
            &jobs_timed_out,
            &requests_failed,
        ] {
            gauge.with_label_values(&[worker_id]).set(0);
        }

        Ok(Self {
            registry,
            worker_id: worker_id.to_string(),
            idle_browsers,
            active_browsers,
            free_capacity,
            jobs_total,
            jobs_timed_out,
            requests_failed,
        })
    }

    pub fn record_pool(&self, idle: usize, active: usize, free_capacity: usize) {
        let label = [self.worker_id.as_str()];
        self.idle_browsers.with_label_values(&label).set(idle as i64);
        self.active_browsers.with_label_values(&label).set(active as i64);
        self.free_capacity
            .with_label_values(&label)
            .set(free_capacity as i64);
    }

    pub fn record_jobs(&self, executed: usize, timed_out: usize) {
        let label = [self.worker_id.as_str()];
        self.jobs_total.with_label_values(&label).add(executed as i64);
        self.jobs_timed_out
            .with_label_values(&label)
            .add(timed_out as i64);
    }

    pub fn record_failed_request(&self) {
        self.requests_failed
            .with_label_values(&[self.worker_id.as_str()])
            .inc();
    }

    /// Start HTTP server for Prometheus metrics on specified port
    pub async fn start_server(self, port: u16) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let app = app.with_state(self);

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Metrics server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}
