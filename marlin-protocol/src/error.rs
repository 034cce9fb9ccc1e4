//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid msgpack: {0}")]
    InvalidMsgpack(&'static str),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("packet length {len} exceeds the configured limit {max}")]
    TooLong { len: usize, max: usize },

    #[error("malformed greeting")]
    BadGreeting,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes carried in the low bits of an error response code.
///
/// These values are part of the wire contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Unknown = 0,
    IllegalParams = 1,
    MemoryIssue = 2,
    InvalidMsgpack = 3,
    UnknownRequestType = 4,
    WrongSchemaVersion = 5,
    AccessDenied = 6,
    NoSuchSpace = 7,
    NoSuchIndex = 8,
    NoSuchFunction = 9,
    ProcLua = 10,
    ConnectionClosed = 11,
    Unsupported = 12,
    TupleFound = 13,
}

impl ErrorCode {
    /// Numeric wire value of this code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a wire value; unrecognized values collapse to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ErrorCode::IllegalParams,
            2 => ErrorCode::MemoryIssue,
            3 => ErrorCode::InvalidMsgpack,
            4 => ErrorCode::UnknownRequestType,
            5 => ErrorCode::WrongSchemaVersion,
            6 => ErrorCode::AccessDenied,
            7 => ErrorCode::NoSuchSpace,
            8 => ErrorCode::NoSuchIndex,
            9 => ErrorCode::NoSuchFunction,
            10 => ErrorCode::ProcLua,
            11 => ErrorCode::ConnectionClosed,
            12 => ErrorCode::Unsupported,
            13 => ErrorCode::TupleFound,
            _ => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::IllegalParams => "ILLEGAL_PARAMS",
            ErrorCode::MemoryIssue => "MEMORY_ISSUE",
            ErrorCode::InvalidMsgpack => "INVALID_MSGPACK",
            ErrorCode::UnknownRequestType => "UNKNOWN_REQUEST_TYPE",
            ErrorCode::WrongSchemaVersion => "WRONG_SCHEMA_VERSION",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::NoSuchSpace => "NO_SUCH_SPACE",
            ErrorCode::NoSuchIndex => "NO_SUCH_INDEX",
            ErrorCode::NoSuchFunction => "NO_SUCH_FUNCTION",
            ErrorCode::ProcLua => "PROC_LUA",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::TupleFound => "TUPLE_FOUND",
        };
        f.write_str(name)
    }
}

/// A typed, client-visible error.
///
/// Raised by request handlers and decoding; serialized into an error frame
/// carrying the numeric code and the message text.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ClientError {
    pub code: ErrorCode,
    pub message: String,
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        let code = match e {
            ProtocolError::InvalidMsgpack(_) => ErrorCode::InvalidMsgpack,
            ProtocolError::MissingField(_) => ErrorCode::IllegalParams,
            ProtocolError::TooLong { .. } => ErrorCode::MemoryIssue,
            _ => ErrorCode::Unknown,
        };
        ClientError::new(code, e.to_string())
    }
}
