//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "paused" while enrichment is paused
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// A cycle is executing right now
    pub cycle_running: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let status = if state.orchestrator.control().is_paused() {
        "paused"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: crate::config::SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        cycle_running: state.orchestrator.is_running(),
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
