use thiserror::Error;

/// Failures that cross the dispatch boundary between caller, coordinator and worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HiveError {
    /// No worker (or no browser) could take the work within the bounded wait.
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    /// A stream send/receive or connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A wall-clock budget expired before a result arrived.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A polled request was addressed to a different worker.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The worker answered with a non-empty error field.
    #[error("worker reported failure: {0}")]
    Remote(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("shutting down")]
    Shutdown,
}

impl HiveError {
    /// Whether the caller may reasonably try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HiveError::Capacity(_) | HiveError::Transport(_) | HiveError::Timeout(_)
        )
    }

    /// Short label used for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            HiveError::Capacity(_) => "capacity",
            HiveError::Transport(_) => "transport",
            HiveError::Timeout(_) => "timeout",
            HiveError::ProtocolMismatch(_) => "protocol_mismatch",
            HiveError::Remote(_) => "remote",
            HiveError::InvalidRequest(_) => "invalid_request",
            HiveError::Shutdown => "shutdown",
        }
    }
}

pub type HiveResult<T> = Result<T, HiveError>;
