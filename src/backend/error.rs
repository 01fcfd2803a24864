use thiserror::Error;

/// Errors produced by backend adapters.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("simulator failed during run: {0}")]
    Runtime(String),

    #[error("backend is not connected")]
    NotConnected,

    #[error("TraCI protocol error: {0}")]
    Protocol(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;
