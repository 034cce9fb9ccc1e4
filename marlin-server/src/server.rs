//! Server assembly.
//!
//! [`Server::start`] spawns the two context threads, "marlin-net" and
//! "marlin-tx", each running a single-threaded cooperative event loop,
//! and wires the bounded pipe between them. The only state they share is
//! the pipe, the output buffers and a couple of counters; everything else
//! stays thread-local.

use crate::config::Config;
use crate::error::ServerError;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::net::{self, NetControl, NetSettings};
use crate::processor::RequestProcessor;
use crate::tx;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Runtime server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Initial input buffer size.
    pub readahead: usize,
    /// Upper bound on a single request.
    pub ibuf_max: usize,
    /// Process-wide in-flight request cap beyond one per connection.
    pub msg_max: usize,
    /// Metrics instance; one is created when not provided.
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("readahead", &self.readahead)
            .field("ibuf_max", &self.ibuf_max)
            .field("msg_max", &self.msg_max)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = crate::config::LimitsConfig::default();
        Self {
            bind_addr: format!("127.0.0.1:{}", marlin_protocol::DEFAULT_PORT)
                .parse()
                .unwrap(),
            readahead: limits.readahead,
            ibuf_max: limits.ibuf_max,
            msg_max: limits.msg_max,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds a runtime configuration from a loaded file configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            readahead: config.limits.readahead,
            ibuf_max: config.limits.ibuf_max,
            msg_max: config.limits.msg_max,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_readahead(mut self, readahead: usize) -> Self {
        self.readahead = readahead;
        self
    }

    pub fn with_ibuf_max(mut self, ibuf_max: usize) -> Self {
        self.ibuf_max = ibuf_max;
        self
    }

    pub fn with_msg_max(mut self, msg_max: usize) -> Self {
        self.msg_max = msg_max;
        self
    }
}

/// A running server: two context threads bound to one listener.
pub struct Server {
    addr: SocketAddr,
    instance: Uuid,
    shutdown: watch::Sender<bool>,
    control: mpsc::Sender<NetControl>,
    net_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the listener and starts both contexts.
    pub fn start<P: RequestProcessor>(
        config: ServerConfig,
        processor: P,
    ) -> Result<Server, ServerError> {
        let metrics = match config.metrics.clone() {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new()?),
        };
        let listener = std::net::TcpListener::bind(config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let instance = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::channel(4);
        // The pipe bound doubles as the publish batch size.
        let (pipe_tx, pipe_rx) = mpsc::channel::<Message>((config.msg_max / 2).max(1));
        let schema_version = Arc::new(AtomicU64::new(0));

        let net_metrics = metrics.clone();
        let net_schema = schema_version.clone();
        let settings = NetSettings {
            readahead: config.readahead,
            ibuf_max: config.ibuf_max,
            msg_max: config.msg_max,
        };
        let net_thread = std::thread::Builder::new()
            .name("marlin-net".into())
            .spawn(move || {
                run_context(net::net_main(
                    listener,
                    pipe_tx,
                    control_rx,
                    shutdown_rx,
                    net_metrics,
                    net_schema,
                    settings,
                ));
            })?;

        let tx_metrics = metrics;
        let tx_thread = std::thread::Builder::new()
            .name("marlin-tx".into())
            .spawn(move || {
                run_context(tx::tx_main(
                    processor,
                    pipe_rx,
                    schema_version,
                    tx_metrics,
                    instance,
                ));
            })?;

        tracing::info!("server listening on {} (instance {})", addr, instance);
        Ok(Server {
            addr,
            instance,
            shutdown: shutdown_tx,
            control: control_tx,
            net_thread: Some(net_thread),
            tx_thread: Some(tx_thread),
        })
    }

    /// The bound listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The instance UUID announced in every greeting.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Moves the listener to a new address through a synchronous NET
    /// round-trip, so the listen socket is never touched concurrently.
    pub async fn rebind(&mut self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(NetControl::Rebind {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServerError::PipeClosed)?;
        let bound = reply_rx.await.map_err(|_| ServerError::PipeClosed)??;
        self.addr = bound;
        Ok(bound)
    }

    /// Stops both contexts and waits for their threads.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.net_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tx_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Runs a context future on a dedicated single-threaded runtime. Every
/// task the context spawns is local to its thread.
fn run_context<F: std::future::Future<Output = ()>>(main: F) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to build context runtime: {}", e);
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(main));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MemoryProcessor;

    #[test]
    fn test_server_start_and_shutdown() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Server::start(config, MemoryProcessor::new()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown();
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_msg_max(4)
            .with_readahead(128)
            .with_ibuf_max(4096);
        assert_eq!(config.msg_max, 4);
        assert_eq!(config.readahead, 128);
        assert_eq!(config.ibuf_max, 4096);
    }
}
