//! # marlin-server
//!
//! The binary protocol front-end of the marlin in-memory database.
//!
//! This crate provides:
//! - A NET context owning sockets, input buffers and response draining
//! - A TX context owning sessions and response production
//! - Rotating per-connection buffer pairs bounding memory per peer
//! - Process-wide admission control with FIFO resume
//! - The `RequestProcessor` boundary to the transaction processor
//! - Configuration and Prometheus metrics

pub mod config;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod server;
pub mod session;

mod connection;
mod ibuf;
mod message;
mod net;
mod obuf;
mod tx;

pub use config::{Config, LimitsConfig, MetricsConfig, NetworkConfig};
pub use error::ServerError;
pub use metrics::{run_metrics_server, Metrics};
pub use processor::{MemoryProcessor, ProcessError, ReplicaLink, RequestProcessor};
pub use server::{Server, ServerConfig};
pub use session::Session;
