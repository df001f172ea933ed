//! HTTP server for Prometheus metrics and debug dumps
//!
//! Runs a lightweight HTTP server on a separate port:
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /health`: liveness
//! - `GET /debug`: names of registered platform tables
//! - `GET /debug/{name}`: dump of one platform table
//! - `GET /debug/queues`: names of registered queue sets
//! - `GET /debug/queues/{name}`: depth and counters of one queue set
//!
//! # Example
//!
//! ```ignore
//! use stream_ingester::metrics_server::MetricsServer;
//!
//! let shutdown = CancellationToken::new();
//! let handle = MetricsServer::start(config.metrics_addr, debug, shutdown.clone());
//!
//! // Later, to shutdown
//! shutdown.cancel();
//! handle.await?;
//! ```

use crate::registry::{CMD_PLATFORMDATA, CMD_QUEUE, DebugRegistry};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, http::StatusCode, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Build the router without binding
    pub fn router(debug: Arc<DebugRegistry>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/debug", get(debug_index_handler))
            .route("/debug/{name}", get(debug_handler))
            .route("/debug/queues", get(queue_index_handler))
            .route("/debug/queues/{name}", get(queue_handler))
            .with_state(debug)
    }

    /// Start the server on `addr`
    ///
    /// Runs until `shutdown` is cancelled.
    pub fn start(
        addr: SocketAddr,
        debug: Arc<DebugRegistry>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let app = Self::router(debug);

            info!(addr = %addr, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Handler for /debug endpoint
async fn debug_index_handler(State(debug): State<Arc<DebugRegistry>>) -> impl IntoResponse {
    Json(debug.names(CMD_PLATFORMDATA))
}

/// Handler for /debug/{name} endpoint
async fn debug_handler(
    State(debug): State<Arc<DebugRegistry>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    dump_response(&debug, CMD_PLATFORMDATA, &name)
}

/// Handler for /debug/queues endpoint
async fn queue_index_handler(State(debug): State<Arc<DebugRegistry>>) -> impl IntoResponse {
    Json(debug.names(CMD_QUEUE))
}

/// Handler for /debug/queues/{name} endpoint
async fn queue_handler(
    State(debug): State<Arc<DebugRegistry>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    dump_response(&debug, CMD_QUEUE, &name)
}

fn dump_response(debug: &DebugRegistry, cmd: u16, name: &str) -> Response {
    match debug.dump(cmd, name) {
        Some(dump) => (StatusCode::OK, Json(dump)).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no debug source '{name}'")).into_response(),
    }
}
