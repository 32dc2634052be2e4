use mailhive_common::{
    HiveError, HiveResult, JobPayload, RequestEnvelope, ResponseEnvelope, SearchDomain, Website,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::orchestrator::{jobs_from_urls, jobs_from_websites, JobOrchestrator};
use crate::search::KeywordSearch;

/// Turns one polled request into exactly one response
pub struct JobHandler {
    worker_id: String,
    orchestrator: Arc<JobOrchestrator>,
    search: Option<Arc<dyn KeywordSearch>>,
    metrics: Metrics,
}

impl JobHandler {
    pub fn new(
        worker_id: impl Into<String>,
        orchestrator: Arc<JobOrchestrator>,
        search: Option<Arc<dyn KeywordSearch>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            orchestrator,
            search,
            metrics,
        }
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Run the request and build its response. Never fails: every error ends
    /// up in the response's error field.
    pub async fn handle(&self, envelope: RequestEnvelope) -> ResponseEnvelope {
        let request_id = envelope.request_id;
        let kind = envelope.kind();

        // Mailboxes are per worker, so this only trips on a routing bug
        if envelope.addressed_worker_id != self.worker_id {
            let error = HiveError::ProtocolMismatch(format!(
                "request addressed to {} was delivered to {}",
                envelope.addressed_worker_id, self.worker_id
            ));
            warn!(request_id = %request_id, "{}", error);
            self.metrics.record_failed_request();
            return ResponseEnvelope::failure(request_id, kind, error);
        }

        info!(request_id = %request_id, kind = %kind, "Handling request");

        let outcome = match envelope.payload {
            JobPayload::MailsFromUrls(urls) => {
                self.run_mail_jobs(jobs_from_urls(&urls)).await
            }
            JobPayload::MailsFromWebsites(websites) => {
                self.run_mail_jobs(jobs_from_websites(websites)).await
            }
            JobPayload::KeywordResults {
                keyword,
                page_count,
                search_domain,
            } => {
                self.search_keyword(&keyword, page_count, &search_domain)
                    .await
            }
        };

        match outcome {
            Ok(websites) => {
                info!(
                    request_id = %request_id,
                    "Request completed with {} website(s)",
                    websites.len()
                );
                ResponseEnvelope::success(request_id, kind, websites)
            }
            Err(e) => {
                warn!(request_id = %request_id, "Request failed: {}", e);
                self.metrics.record_failed_request();
                ResponseEnvelope::failure(request_id, kind, e)
            }
        }
    }

    async fn run_mail_jobs(
        &self,
        jobs: Vec<crate::task_queue::Job>,
    ) -> HiveResult<Vec<Website>> {
        let websites = self.orchestrator.execute(jobs).await?;
        let timed_out = websites.iter().filter(|w| w.timed_out).count();
        self.metrics.record_jobs(websites.len(), timed_out);
        Ok(websites)
    }

    async fn search_keyword(
        &self,
        keyword: &str,
        page_count: u32,
        search_domain: &str,
    ) -> HiveResult<Vec<Website>> {
        let search = self.search.as_ref().ok_or_else(|| {
            HiveError::InvalidRequest("keyword search is not configured on this worker".into())
        })?;

        let domain = SearchDomain::from_domain_or_default(search_domain);
        search
            .search(keyword, page_count, domain)
            .await
            .map_err(|e| HiveError::Transport(format!("{} search failed: {}", search.name(), e)))
    }
}
