//! `GET /metrics` while a batch runs

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0:?}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    Json(metrics.read().await.clone())
}

/// Router serving the shared snapshot as JSON
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Runs the metrics HTTP server on `bind` (e.g. `127.0.0.1:7878`)
pub async fn run_metrics_server(metrics: SharedMetrics, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Metrics server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
