//! Probe and scrape endpoints.
//!
//! - `GET /health/liveness`: the process is up
//! - `GET /health/readiness`: 200 once the log and the database are both
//!   connected, 503 with the same JSON body before that
//! - `GET /metrics`: Prometheus text format

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use beacon_runtime::Readiness;
use beacon_runtime::metrics::MetricsServer;
use std::sync::Arc;

/// Shared state of the probe handlers.
#[derive(Clone)]
pub struct ProbeState {
    readiness: Arc<Readiness>,
    metrics: Arc<MetricsServer>,
}

impl ProbeState {
    /// Bundle the readiness flags and the metrics recorder.
    #[must_use]
    pub const fn new(readiness: Arc<Readiness>, metrics: Arc<MetricsServer>) -> Self {
        Self { readiness, metrics }
    }
}

/// Build the probe router.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness(State(state): State<ProbeState>) -> Response {
    let report = state.readiness.report();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    match state.metrics.render() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
