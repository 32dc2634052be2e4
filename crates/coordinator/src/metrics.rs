use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub workers: IntGauge,
    pub pending_requests: IntGauge,
    pub dispatch_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let workers = IntGauge::new(
            "mailhive_coordinator_workers",
            "Number of workers in the registry",
        )?;
        registry.register(Box::new(workers.clone()))?;

        // Requests registered with the correlator and not yet answered
        let pending_requests = IntGauge::new(
            "mailhive_coordinator_pending_requests",
            "Dispatched requests waiting for a worker response",
        )?;
        registry.register(Box::new(pending_requests.clone()))?;

        let dispatch_failures = IntCounterVec::new(
            Opts::new(
                "mailhive_coordinator_dispatch_failures",
                "Dispatch calls that ended in an error",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(dispatch_failures.clone()))?;

        Ok(Self {
            registry,
            workers,
            pending_requests,
            dispatch_failures,
        })
    }

    pub fn record_failure(&self, reason: &str) {
        self.dispatch_failures.with_label_values(&[reason]).inc();
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

pub async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_labelled_by_reason() {
        let metrics = Metrics::new().unwrap();
        metrics.record_failure("capacity");
        metrics.record_failure("capacity");
        metrics.record_failure("timeout");

        assert_eq!(
            metrics.dispatch_failures.with_label_values(&["capacity"]).get(),
            2
        );
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("mailhive_coordinator_dispatch_failures"));
    }
}
