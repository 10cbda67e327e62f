//! HTTP endpoints.
//!
//! - `GET /`: greeting
//! - `GET /download`: run (or skip) one pull cycle, then acknowledge
//! - `GET /metrics`: Prometheus exposition
//! - `GET /healthz`: liveness

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::PrometheusMetrics;
use crate::orchestrator::{CycleOutcome, Orchestrator};

pub const GREETING: &str = "Hello Download Exporter!";
pub const DOWNLOAD_ACK: &str = "Download triggered";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<PrometheusMetrics>,
}

/// Response envelope.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct DataResponse {
    pub data: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Whether a pull cycle is running right now.
    pub cycle_in_flight: bool,
}

/// Create the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/download", get(download))
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Json(DataResponse {
        data: GREETING.to_string(),
    })
}

/// Runs the cycle to completion before answering; the answer is the same
/// whether the cycle ran or was skipped.
async fn download(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.run_cycle().await {
        CycleOutcome::Skipped => info!("On-demand pull cycle skipped, another is in flight"),
        CycleOutcome::Completed { succeeded, failed } => {
            info!(succeeded, failed, "On-demand pull cycle finished")
        }
    }

    Json(DataResponse {
        data: DOWNLOAD_ACK.to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "pull-exporter".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cycle_in_flight: state.orchestrator.is_in_flight(),
    })
}
