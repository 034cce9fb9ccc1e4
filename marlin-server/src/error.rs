//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] marlin_protocol::ProtocolError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("context pipe closed")]
    PipeClosed,
}
