//! Metrics HTTP server for clipmerge
//!
//! Exposes the shared snapshot at `GET /metrics` for dashboards and monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::{collect_system_metrics, MetricsSnapshot, SharedMetrics};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics; refreshes system and timestamp fields before replying.
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let system = tokio::task::spawn_blocking(collect_system_metrics)
        .await
        .unwrap_or_default();
    let mut snapshot = metrics.write().await;
    snapshot.system = system;
    snapshot.timestamp_unix_ms = now_unix_ms();
    Json(snapshot.clone())
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serves the metrics router on `bind` until the process exits.
pub async fn run_metrics_server(metrics: SharedMetrics, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");
    axum::serve(listener, create_metrics_router(metrics)).await?;
    Ok(())
}
