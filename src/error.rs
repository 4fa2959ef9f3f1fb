//! Error types for poolgate.

use thiserror::Error;

/// Main error type for poolgate.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control protocol violation: {0}")]
    Protocol(String),

    #[error("failed to dial worker data socket {addr}: {source}")]
    BackendDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for poolgate operations.
pub type Result<T> = std::result::Result<T, PoolError>;
