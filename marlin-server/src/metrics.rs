//! Prometheus metrics for the marlin server.
//!
//! This module provides:
//! - Metrics registry with the NET byte counters and request/error counters
//! - HTTP server to expose metrics at the `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Prometheus metrics for the marlin server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// SENT: bytes written to client sockets.
    pub net_sent_bytes: IntCounter,
    /// RECEIVED: bytes read from client sockets.
    pub net_received_bytes: IntCounter,
    /// Total connections accepted.
    pub connections_total: IntCounter,
    /// Currently active connections.
    pub connections_active: IntGauge,
    /// Total requests by operation type.
    pub requests_total: IntCounterVec,
    /// Total error replies by error code.
    pub errors_total: IntCounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let net_sent_bytes = IntCounter::with_opts(Opts::new(
            "marlin_net_sent_bytes_total",
            "Bytes written to client sockets (SENT)",
        ))?;
        registry.register(Box::new(net_sent_bytes.clone()))?;

        let net_received_bytes = IntCounter::with_opts(Opts::new(
            "marlin_net_received_bytes_total",
            "Bytes read from client sockets (RECEIVED)",
        ))?;
        registry.register(Box::new(net_received_bytes.clone()))?;

        let connections_total = IntCounter::with_opts(Opts::new(
            "marlin_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::with_opts(Opts::new(
            "marlin_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let requests_total = IntCounterVec::new(
            Opts::new("marlin_requests_total", "Total requests by operation"),
            &["operation"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("marlin_errors_total", "Total error replies by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            net_sent_bytes,
            net_received_bytes,
            connections_total,
            connections_active,
            requests_total,
            errors_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = String::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_utf8(&metric_families, &mut buffer)
            .expect("encode metrics");
        buffer.into_bytes()
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            let body = metrics.encode();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        "/health" | "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK")))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap(),
    };

    Ok(response)
}
