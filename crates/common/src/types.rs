use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HiveError;

/// Correlation id assigned by the coordinator when a request is dispatched
pub type RequestId = u64;

/// Generate a fresh request id from a v4 UUID
pub fn new_request_id() -> RequestId {
    uuid::Uuid::new_v4().as_u64_pair().0
}

/// Accumulating result for one target site.
///
/// Every list field is an append-unique sequence: insertion order is kept and
/// duplicates are dropped. Mutate them through [`append_unique`] only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Website {
    pub base_url: String,
    pub title: String,
    pub description: String,
    pub paths: Vec<String>,
    pub mails: Vec<String>,
    pub socials: Vec<String>,
    pub languages: Vec<String>,
    pub regions: Vec<String>,
    pub matched_snippet_words: Vec<String>,
    pub timed_out: bool,
}

impl Website {
    /// Create an empty record keyed by the normalized form of `url`
    pub fn new(url: &str) -> Self {
        Self {
            base_url: normalize_base_url(url),
            ..Default::default()
        }
    }
}

/// Push `item` unless it is already present. Returns true when it was added.
pub fn append_unique(list: &mut Vec<String>, item: impl Into<String>) -> bool {
    let item = item.into();
    if list.iter().any(|existing| *existing == item) {
        return false;
    }
    list.push(item);
    true
}

/// Reduce a URL to `scheme://host[:port]`.
///
/// Path, query, fragment and trailing slashes are dropped. The result is a
/// fixed point: normalizing it again returns the same string.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Ok(parsed) = url::Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            return match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            };
        }
    }

    // Not an absolute URL: cut at the first path, query or fragment delimiter
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, trimmed),
    };
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');

    match scheme {
        Some(scheme) => format!("{}://{}", scheme, authority),
        None => authority.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    GetMailsFromUrls,
    GetMailsFromWebsites,
    GetKeywordResults,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::GetMailsFromUrls => "get_mails_from_urls",
            JobKind::GetMailsFromWebsites => "get_mails_from_websites",
            JobKind::GetKeywordResults => "get_keyword_results",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search engine locale used for keyword queries.
///
/// Unknown domains fall back to `google.fr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchDomain {
    #[default]
    Fr,
    Us,
    Es,
    Uk,
}

impl SearchDomain {
    pub fn domain(&self) -> &'static str {
        match self {
            SearchDomain::Fr => "google.fr",
            SearchDomain::Us => "google.us",
            SearchDomain::Es => "google.es",
            SearchDomain::Uk => "google.uk",
        }
    }

    /// Country code (`gl`) sent to the result-page API
    pub fn country(&self) -> &'static str {
        match self {
            SearchDomain::Fr => "fr",
            SearchDomain::Us => "us",
            SearchDomain::Es => "es",
            SearchDomain::Uk => "uk",
        }
    }

    /// Interface language (`hl`) sent to the result-page API
    pub fn language(&self) -> &'static str {
        match self {
            SearchDomain::Fr => "fr",
            SearchDomain::Us | SearchDomain::Uk => "en",
            SearchDomain::Es => "es",
        }
    }

    /// Parse leniently, falling back to the default locale
    pub fn from_domain_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for SearchDomain {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google.fr" => Ok(Self::Fr),
            "google.us" => Ok(Self::Us),
            "google.es" => Ok(Self::Es),
            "google.uk" => Ok(Self::Uk),
            _ => Err(()),
        }
    }
}

/// What the caller asked for, one variant per [`JobKind`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPayload {
    MailsFromUrls(Vec<String>),
    MailsFromWebsites(Vec<Website>),
    KeywordResults {
        keyword: String,
        page_count: u32,
        search_domain: String,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::MailsFromUrls(_) => JobKind::GetMailsFromUrls,
            JobPayload::MailsFromWebsites(_) => JobKind::GetMailsFromWebsites,
            JobPayload::KeywordResults { .. } => JobKind::GetKeywordResults,
        }
    }

    /// Free worker capacity this payload needs.
    ///
    /// Mail batches need one job slot per unique normalized base URL; keyword
    /// searches run without a browser and need none.
    pub fn required_capacity(&self) -> usize {
        match self {
            JobPayload::MailsFromUrls(urls) => {
                unique_base_urls(urls.iter().map(|u| u.as_str())).len()
            }
            JobPayload::MailsFromWebsites(websites) => {
                unique_base_urls(websites.iter().map(|w| w.base_url.as_str())).len()
            }
            JobPayload::KeywordResults { .. } => 0,
        }
    }
}

/// Normalized base URLs in first-seen order, without duplicates
pub fn unique_base_urls<'a>(urls: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut unique = Vec::new();
    for url in urls {
        append_unique(&mut unique, normalize_base_url(url));
    }
    unique
}

/// A request routed to exactly one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub addressed_worker_id: String,
    pub payload: JobPayload,
}

impl RequestEnvelope {
    pub fn new(addressed_worker_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            request_id: new_request_id(),
            addressed_worker_id: addressed_worker_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// The single answer a worker sends back for one [`RequestEnvelope`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub kind: JobKind,
    pub result: Option<Vec<Website>>,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(request_id: RequestId, kind: JobKind, websites: Vec<Website>) -> Self {
        Self {
            request_id,
            kind,
            result: Some(websites),
            error: None,
        }
    }

    pub fn failure(request_id: RequestId, kind: JobKind, error: impl ToString) -> Self {
        Self {
            request_id,
            kind,
            result: None,
            error: Some(error.to_string()),
        }
    }

    /// Convert into the caller-visible outcome. A non-empty error wins over any result.
    pub fn into_result(self) -> Result<Vec<Website>, HiveError> {
        match self.error {
            Some(error) if !error.is_empty() => Err(HiveError::Remote(error)),
            _ => Ok(self.result.unwrap_or_default()),
        }
    }
}
