//! HTTP server for the Prometheus metrics and health endpoints.
//!
//! Runs on a separate tokio task and serves `/metrics` for Prometheus
//! scraping and `/health` for load balancers.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::admission::ConnectionAdmission;
use crate::hub::PresenceHub;

/// What `/health` reports on.
#[derive(Clone)]
pub struct HealthState {
    pub instance: String,
    pub backend: &'static str,
    pub admission: Arc<ConnectionAdmission>,
    pub hub: Arc<PresenceHub>,
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// Handler for GET /health.
async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "instance": state.instance,
        "bus": state.backend,
        "connections": state.admission.active_connections(),
        "hubEntries": state.hub.connection_count(),
    }))
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP server until `shutdown` is cancelled.
///
/// Binds to `0.0.0.0:port`. This is a long-running task that should be
/// spawned in the background.
pub async fn run_http_server(port: u16, state: HealthState, shutdown: CancellationToken) {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Prometheus HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }
}
