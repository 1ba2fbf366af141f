use thiserror::Error;

/// Event store or counter cache could not be reached. Logged and swallowed by
/// the monitoring pipeline.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Alert notification was not delivered. Never retried.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid recipient address {0}")]
    InvalidRecipient(String),
    #[error("failed to build message: {0}")]
    Message(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Token service could not be built or could not issue a token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("session id must be non-empty and must not contain ':'")]
    InvalidSessionId,
    #[error("signing secret must not be empty")]
    EmptySecret,
}

/// Why a CSRF token was rejected. Kept for logs only; callers see a boolean.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailure {
    #[error("token is not session_id:issued_at:signature")]
    Malformed,
    #[error("token bound to a different session")]
    SessionMismatch,
    #[error("token older than its lifetime")]
    Expired,
    #[error("token issued in the future")]
    IssuedInFuture,
    #[error("signature mismatch")]
    BadSignature,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
