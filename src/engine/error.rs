use chrono::NaiveDateTime;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or policy-violating input.
    Validation(String),
    NotFound(&'static str, Ulid),
    Forbidden(String),
    /// State changed under the caller: the time is taken or the slot was claimed first.
    Conflict(String),
    /// No published slot covers the requested instant.
    Unavailable {
        provider_id: Ulid,
        at: NaiveDateTime,
    },
    InvalidTransition(String),
    LimitExceeded(&'static str),
    WalError(String),
}

/// Flat classification for transports mapping errors to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    Unavailable,
    InvalidTransition,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Unavailable { .. } => ErrorKind::Unavailable,
            EngineError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Whether a fresh attempt against current availability may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::Unavailable { provider_id, at } => {
                write!(f, "provider {provider_id} has no available slot at {at}")
            }
            EngineError::InvalidTransition(msg) => write!(f, "invalid status change: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
