//! marlin - in-memory database server
//!
//! Binary protocol front-end over a pluggable transaction processor.

use marlin_server::{
    run_metrics_server, Config, MemoryProcessor, Metrics, Server, ServerConfig,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MARLIN_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if MARLIN_CONFIG is set, then env
    // overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("MARLIN_CONFIG") {
                tracing::info!("loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("MARLIN_CONFIG").is_ok() {
                tracing::error!("failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("using default configuration");
            Config::default()
        }
    };

    tracing::info!("starting marlin server");
    tracing::info!("  bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  limits: readahead={}, ibuf_max={}, msg_max={}",
        config.limits.readahead,
        config.limits.ibuf_max,
        config.limits.msg_max
    );

    let metrics = Arc::new(Metrics::new()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Metrics HTTP server, if enabled
    let metrics_handle = if config.metrics.enabled {
        tracing::info!("  metrics: enabled on {}", config.metrics.bind_addr);
        let addr = config.metrics.bind_addr;
        let metrics = metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  metrics: disabled");
        None
    };

    // Start the front-end over the in-memory processor
    let server_config = ServerConfig::from_config(&config).with_metrics(metrics);
    let server = Server::start(server_config, MemoryProcessor::new())?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("received shutdown signal, stopping server...");

    let _ = shutdown_tx.send(true);
    server.shutdown();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    Ok(())
}
