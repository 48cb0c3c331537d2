//! Admin HTTP surface.
//!
//! Read-only JSON endpoints over the connection monitor:
//! - `GET /health`: pool and main connection status
//! - `GET /stats`: current pool statistics
//! - `GET /metrics/history`: monitor snapshots, oldest first
//!
//! On SIGINT/SIGTERM the server drains and every connection is force-closed.

use crate::db::ConnectionFactory;
use crate::error::{PoolError, PoolResult};
use crate::models::{MetricsSnapshot, PoolStats, ReadyState};
use crate::monitor::ConnectionMonitor;
use crate::transport::Transport;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub main_connection: Option<ReadyState>,
    pub active_connections: usize,
    pub max_connections: usize,
}

/// HTTP transport serving the admin endpoints.
pub struct AdminTransport<F: ConnectionFactory> {
    monitor: Arc<ConnectionMonitor<F>>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl<F: ConnectionFactory> AdminTransport<F> {
    pub fn new(monitor: Arc<ConnectionMonitor<F>>, host: impl Into<String>, port: u16) -> Self {
        Self {
            monitor,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Router with every admin route.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health::<F>))
            .route("/stats", get(stats::<F>))
            .route("/metrics/history", get(metrics_history::<F>))
            .with_state(Arc::clone(&self.monitor))
    }

    /// Serve on `listener` until `shutdown` resolves, then close all connections.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> PoolResult<()> {
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        // Close connections whether or not the server stopped cleanly
        info!("Closing database connections");
        self.monitor.force_close_all().await;

        result.map_err(|e| {
            error!(error = %e, "HTTP server error");
            PoolError::internal(format!("HTTP server error: {}", e))
        })
    }
}

impl<F: ConnectionFactory> Transport for AdminTransport<F> {
    async fn run(&self) -> PoolResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting admin server on {}", bind_addr);

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            PoolError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        self.serve(listener, wait_for_signal()).await?;
        info!("Admin server stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

async fn health<F: ConnectionFactory>(
    State(monitor): State<Arc<ConnectionMonitor<F>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let stats = monitor.current_stats();
    let shutting_down = monitor.pool().is_closed();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(HealthResponse {
            status: if shutting_down { "shutting_down" } else { "ok" },
            main_connection: monitor.main_connection_state(),
            active_connections: stats.active_connections,
            max_connections: stats.max_connections,
        }),
    )
}

async fn stats<F: ConnectionFactory>(
    State(monitor): State<Arc<ConnectionMonitor<F>>>,
) -> Json<PoolStats> {
    Json(monitor.current_stats())
}

async fn metrics_history<F: ConnectionFactory>(
    State(monitor): State<Arc<ConnectionMonitor<F>>>,
) -> Json<Vec<MetricsSnapshot>> {
    Json(monitor.metrics_history())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
