// Overseer error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverseerError {
    /// Malformed plan/profile/request; surfaced synchronously, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Step not ready, run already terminal, duplicate start
    #[error("Precondition denied: {0}")]
    PreconditionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport unavailable or publish deadline exceeded; retryable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence contention or unavailability; retryable
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tool call failed on the worker, or the worker went silent
    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    /// Internal invariant violation; the run is failed immediately
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl OverseerError {
    /// Transient errors are absorbed by retry with back-off; everything else
    /// propagates as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, OverseerError::Transport(_) | OverseerError::Storage(_))
    }
}

impl From<serde_json::Error> for OverseerError {
    fn from(err: serde_json::Error) -> Self {
        OverseerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OverseerError {
    fn from(err: std::io::Error) -> Self {
        OverseerError::Storage(err.to_string())
    }
}

impl From<overseer_types::ProfileError> for OverseerError {
    fn from(err: overseer_types::ProfileError) -> Self {
        OverseerError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OverseerError>;
