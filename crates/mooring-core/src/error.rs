use thiserror::Error;

/// Errors produced by the mooring protocol layer.
#[derive(Debug, Error)]
pub enum MooringError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid scope id: {0}")]
    InvalidScopeId(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("no endpoint set")]
    NoEndpoint,

    #[error("already connected")]
    AlreadyConnected,

    #[error("closed")]
    Closed,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type MooringResult<T> = Result<T, MooringError>;
