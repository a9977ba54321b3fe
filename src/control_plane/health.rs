//! `GET /health`, `GET /ready`, `GET /metrics`.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use super::SharedState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

/// Never blocks on a dependency; reports only that the process is up.
pub async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok", version: VERSION })
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    failing: Vec<&'static str>,
}

/// `200` once the runtime has finished its startup probes and flipped
/// `AppState::ready`; `503` with the failing component otherwise.
pub async fn ready(State(state): State<SharedState>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        Json(ReadyBody { status: "ready", failing: vec![] }).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ReadyBody { status: "not_ready", failing: vec!["startup_probes"] })).into_response()
    }
}

/// Prometheus text exposition format.
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    ([("content-type", "text/plain; version=0.0.4")], state.metrics.render())
}
