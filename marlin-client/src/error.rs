//! Client error types.

use marlin_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] marlin_protocol::ProtocolError),

    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("response sync {got} does not match request sync {expected}")]
    SyncMismatch { expected: u64, got: u64 },

    #[error("connection closed by server")]
    ConnectionClosed,
}
