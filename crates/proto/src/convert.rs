use mailhive_common::{
    HiveError, JobKind, JobPayload, RequestEnvelope, ResponseEnvelope, Website,
};

use crate::dispatch::{self, request_envelope::Payload};

impl From<Website> for dispatch::Website {
    fn from(w: Website) -> Self {
        Self {
            base_url: w.base_url,
            title: w.title,
            description: w.description,
            paths: w.paths,
            mails: w.mails,
            socials: w.socials,
            languages: w.languages,
            regions: w.regions,
            matched_snippet_words: w.matched_snippet_words,
            timed_out: w.timed_out,
        }
    }
}

impl From<dispatch::Website> for Website {
    fn from(w: dispatch::Website) -> Self {
        Self {
            base_url: w.base_url,
            title: w.title,
            description: w.description,
            paths: w.paths,
            mails: w.mails,
            socials: w.socials,
            languages: w.languages,
            regions: w.regions,
            matched_snippet_words: w.matched_snippet_words,
            timed_out: w.timed_out,
        }
    }
}

fn websites_to_wire(websites: Vec<Website>) -> dispatch::WebsiteBatch {
    dispatch::WebsiteBatch {
        websites: websites.into_iter().map(Into::into).collect(),
    }
}

fn websites_from_wire(batch: dispatch::WebsiteBatch) -> Vec<Website> {
    batch.websites.into_iter().map(Into::into).collect()
}

impl From<JobKind> for dispatch::JobKind {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::GetMailsFromUrls => dispatch::JobKind::GetMailsFromUrls,
            JobKind::GetMailsFromWebsites => dispatch::JobKind::GetMailsFromWebsites,
            JobKind::GetKeywordResults => dispatch::JobKind::GetKeywordResults,
        }
    }
}

impl TryFrom<dispatch::JobKind> for JobKind {
    type Error = HiveError;

    fn try_from(kind: dispatch::JobKind) -> Result<Self, Self::Error> {
        match kind {
            dispatch::JobKind::GetMailsFromUrls => Ok(JobKind::GetMailsFromUrls),
            dispatch::JobKind::GetMailsFromWebsites => Ok(JobKind::GetMailsFromWebsites),
            dispatch::JobKind::GetKeywordResults => Ok(JobKind::GetKeywordResults),
            dispatch::JobKind::Unspecified => {
                Err(HiveError::InvalidRequest("job kind not set".to_string()))
            }
        }
    }
}

impl From<JobPayload> for Payload {
    fn from(payload: JobPayload) -> Self {
        match payload {
            JobPayload::MailsFromUrls(urls) => Payload::MailsFromUrls(dispatch::UrlBatch { urls }),
            JobPayload::MailsFromWebsites(websites) => {
                Payload::MailsFromWebsites(websites_to_wire(websites))
            }
            JobPayload::KeywordResults {
                keyword,
                page_count,
                search_domain,
            } => Payload::KeywordResults(dispatch::KeywordQuery {
                keyword,
                page_count,
                search_domain,
            }),
        }
    }
}

impl From<Payload> for JobPayload {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::MailsFromUrls(batch) => JobPayload::MailsFromUrls(batch.urls),
            Payload::MailsFromWebsites(batch) => {
                JobPayload::MailsFromWebsites(websites_from_wire(batch))
            }
            Payload::KeywordResults(query) => JobPayload::KeywordResults {
                keyword: query.keyword,
                page_count: query.page_count,
                search_domain: query.search_domain,
            },
        }
    }
}

impl From<RequestEnvelope> for dispatch::RequestEnvelope {
    fn from(envelope: RequestEnvelope) -> Self {
        Self {
            request_id: envelope.request_id,
            addressed_worker_id: envelope.addressed_worker_id,
            payload: Some(envelope.payload.into()),
        }
    }
}

/// Parse a polled request; a request without payload is malformed
pub fn request_from_wire(wire: dispatch::RequestEnvelope) -> Result<RequestEnvelope, HiveError> {
    let payload = wire.payload.ok_or_else(|| {
        HiveError::InvalidRequest(format!("request {} carries no payload", wire.request_id))
    })?;

    Ok(RequestEnvelope {
        request_id: wire.request_id,
        addressed_worker_id: wire.addressed_worker_id,
        payload: payload.into(),
    })
}

impl From<ResponseEnvelope> for dispatch::ResponseEnvelope {
    fn from(response: ResponseEnvelope) -> Self {
        Self {
            request_id: response.request_id,
            kind: dispatch::JobKind::from(response.kind) as i32,
            result: response.result.map(websites_to_wire),
            error: response.error.unwrap_or_default(),
        }
    }
}

/// Parse a submitted result; an unknown kind is malformed
pub fn response_from_wire(
    wire: dispatch::ResponseEnvelope,
) -> Result<ResponseEnvelope, HiveError> {
    let kind = dispatch::JobKind::try_from(wire.kind)
        .map_err(|_| HiveError::InvalidRequest(format!("unknown job kind {}", wire.kind)))?;

    Ok(ResponseEnvelope {
        request_id: wire.request_id,
        kind: kind.try_into()?,
        result: wire.result.map(websites_from_wire),
        error: if wire.error.is_empty() {
            None
        } else {
            Some(wire.error)
        },
    })
}
