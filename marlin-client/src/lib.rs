//! # marlin-client
//!
//! Async client for the marlin binary protocol: greeting handshake,
//! request encoding, pipelining and sync-correlated responses.

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::Connection;
pub use error::ClientError;
