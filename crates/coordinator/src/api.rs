use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mailhive_common::{HiveError, JobPayload, SearchDomain, Website};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::info;

use crate::dispatcher::JobDispatcher;
use crate::metrics::{metrics_handler, Metrics};
use crate::registry::WorkerSummary;

const MAX_PAGES: u32 = 20;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(www\.)?[A-Za-z0-9-]+(\.[A-Za-z]{2,})(/\S*)?").unwrap()
});

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<JobDispatcher>,
    pub metrics: Metrics,
}

impl FromRef<AppState> for Metrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct MailsRequest {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeywordRequest {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub pages: u32,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub hint: String,
}

impl FieldError {
    fn new(field: &str, hint: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            hint: hint.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<FieldError>),
    Dispatch(HiveError),
}

impl From<HiveError> for ApiError {
    fn from(e: HiveError) -> Self {
        ApiError::Dispatch(e)
    }
}

/// HTTP status a dispatch failure is reported with
pub fn status_for(error: &HiveError) -> StatusCode {
    match error {
        HiveError::Capacity(_) | HiveError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        HiveError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HiveError::Remote(_) | HiveError::Transport(_) | HiveError::ProtocolMismatch(_) => {
            StatusCode::BAD_GATEWAY
        }
        HiveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => (StatusCode::BAD_REQUEST, Json(errors)).into_response(),
            ApiError::Dispatch(e) => (
                status_for(&e),
                Json(ErrorBody {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                }),
            )
                .into_response(),
        }
    }
}

pub fn router(state: AppState, expose_metrics: bool) -> Router {
    let mut router = Router::new()
        .route("/api/getmails", post(get_mails))
        .route("/api/keyword", post(keyword))
        .route("/api/keywordmail", post(keyword_mail))
        .route("/api/workers", get(workers));

    if expose_metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.with_state(state)
}

pub fn validate_urls(urls: &[String]) -> Vec<FieldError> {
    if urls.is_empty() {
        return vec![FieldError::new("urls", "at least one url is required")];
    }

    urls.iter()
        .enumerate()
        .filter(|(_, url)| !URL_PATTERN.is_match(url))
        .map(|(i, url)| {
            FieldError::new(
                &format!("urls[{}]", i),
                format!("'{}' is not an http(s) url", url),
            )
        })
        .collect()
}

pub fn validate_keyword(request: &KeywordRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if request.keyword.trim().is_empty() {
        errors.push(FieldError::new("keyword", "keyword must not be empty"));
    }
    if !(1..=MAX_PAGES).contains(&request.pages) {
        errors.push(FieldError::new(
            "pages",
            format!("pages must be between 1 and {}", MAX_PAGES),
        ));
    }
    if let Some(domain) = &request.domain {
        if !domain.starts_with("google") || !domain.contains('.') {
            errors.push(FieldError::new("domain", "domain must look like google.fr"));
        }
    }

    errors
}

fn keyword_payload(request: &KeywordRequest) -> JobPayload {
    let domain = request
        .domain
        .as_deref()
        .map(SearchDomain::from_domain_or_default)
        .unwrap_or_default();

    JobPayload::KeywordResults {
        keyword: request.keyword.trim().to_string(),
        page_count: request.pages,
        search_domain: domain.domain().to_string(),
    }
}

async fn get_mails(
    State(state): State<AppState>,
    Json(request): Json<MailsRequest>,
) -> Result<Json<DataResponse<Vec<Website>>>, ApiError> {
    let errors = validate_urls(&request.urls);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    info!("Mail extraction requested for {} url(s)", request.urls.len());
    let data = state
        .dispatcher
        .dispatch(JobPayload::MailsFromUrls(request.urls))
        .await?;
    Ok(Json(DataResponse { data }))
}

async fn keyword(
    State(state): State<AppState>,
    Json(request): Json<KeywordRequest>,
) -> Result<Json<DataResponse<Vec<Website>>>, ApiError> {
    let errors = validate_keyword(&request);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let data = state.dispatcher.dispatch(keyword_payload(&request)).await?;
    Ok(Json(DataResponse { data }))
}

/// Keyword search, then mail extraction over the sites it found
async fn keyword_mail(
    State(state): State<AppState>,
    Json(request): Json<KeywordRequest>,
) -> Result<Json<DataResponse<Vec<Website>>>, ApiError> {
    let errors = validate_keyword(&request);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let found = state.dispatcher.dispatch(keyword_payload(&request)).await?;
    if found.is_empty() {
        return Ok(Json(DataResponse { data: found }));
    }

    info!(
        "Keyword '{}' found {} site(s), extracting mails",
        request.keyword,
        found.len()
    );
    let data = state
        .dispatcher
        .dispatch(JobPayload::MailsFromWebsites(found))
        .await?;
    Ok(Json(DataResponse { data }))
}

async fn workers(State(state): State<AppState>) -> Json<DataResponse<Vec<WorkerSummary>>> {
    Json(DataResponse {
        data: state.dispatcher.registry().summaries(),
    })
}
