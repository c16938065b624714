use thiserror::Error;

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Errors surfaced by the chain adapter.
///
/// The transient/permanent split drives retry policy everywhere: transient
/// failures are retried with capped exponential backoff, permanent failures
/// are surfaced to the caller immediately.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Network-level failure, timeout, 5xx or rate limit. Retryable.
    #[error("transient chain error: {0}")]
    Transient(String),
    /// Revert, malformed response, nonce exhaustion. Not retryable.
    #[error("permanent chain error: {0}")]
    Permanent(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }

    /// The raw error text, used to match idempotent reverts
    /// ("already paused", "already blocked").
    pub fn message(&self) -> &str {
        match self {
            ChainError::Transient(msg) | ChainError::Permanent(msg) => msg,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return ChainError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return ChainError::Transient(format!("http {status}: {err}"));
            }
            return ChainError::Permanent(format!("http {status}: {err}"));
        }
        // Request never completed (DNS, broken pipe); treat as transient.
        ChainError::Transient(err.to_string())
    }
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Failure modes of the LLM endpoint the reasoner must survive.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("llm http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("llm returned an empty response")]
    EmptyResponse,
    #[error("llm credential rejected (status {0})")]
    Credential(u16),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Error shape of the HTTP API: `{error: {kind, message}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Upstream(_) => "upstream",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Upstream(_) => 502,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Upstream(err.to_string())
    }
}
