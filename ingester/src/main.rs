//! Stream ingester - sharded telemetry ingestion pipeline
//!
//! ## Usage
//!
//! ```bash
//! # Run against a local ClickHouse and controller
//! cargo run
//!
//! # Print rows instead of storing them
//! STREAM_SINK=stdout STREAM_LOG_LEVEL=debug cargo run
//! ```
//!
//! ## Environment Variables
//!
//! - `STREAM_METRICS_ADDR`: Metrics/debug server address (default: "0.0.0.0:9090")
//! - `STREAM_DECODER_QUEUE_COUNT`: Partitions per message type (default: 2)
//! - `STREAM_THROTTLE`: Records per window across all partitions (default: 50000)
//! - `STREAM_CKDB_ADDR`: ClickHouse HTTP address (default: "127.0.0.1:8123")
//! - `STREAM_SINK`: `clickhouse`, `stdout` or `stdout-json` (default: "clickhouse")
//! - `STREAM_LOG_LEVEL`: Log level (default: "info")
//! - `STREAM_LOG_FORMAT`: `json` or `pretty` (default: "pretty")
//!
//! See `Config::from_env` for the full list.

use std::sync::Arc;
use stream_ingester::backend;
use stream_ingester::config::{Config, LogFormat};
use stream_ingester::metrics::Metrics;
use stream_ingester::metrics_server::MetricsServer;
use stream_ingester::{BufferPool, DebugRegistry, HandlerRegistry, Stream};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.as_str().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!(
        metrics_addr = %config.metrics_addr,
        partitions = config.decoder_queue_count,
        queue_size = config.decoder_queue_size,
        backpressure = %config.backpressure,
        throttle = config.throttle,
        ckdb = %config.ckdb.addr,
        "Starting stream ingester"
    );

    Metrics::init()?;

    let pool = Arc::new(BufferPool::default());
    let mut handlers = HandlerRegistry::new(Arc::clone(&pool));
    let debug = Arc::new(DebugRegistry::new());
    let backend = backend::from_config(&config);

    let stream = Stream::new(&config, &mut handlers, &debug, backend.as_ref())?;
    stream.start()?;

    // The receiver attaches here: it acquires buffers from the pool and
    // calls `dispatch_from` with its own producer slot on the shared registry.
    let handlers = Arc::new(handlers);
    info!(handlers = handlers.handler_count(), "Handlers registered");

    let shutdown = CancellationToken::new();
    let metrics_handle = MetricsServer::start(config.metrics_addr, debug, shutdown.clone());

    shutdown_signal().await;

    stream.close().await?;
    shutdown.cancel();
    if let Err(e) = metrics_handle.await {
        tracing::error!(error = %e, "Metrics server task failed");
    }

    info!(
        outstanding = pool.outstanding(),
        acquired = pool.total_acquired(),
        "Stream ingester shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
