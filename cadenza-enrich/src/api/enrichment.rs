//! Enrichment status, control and run endpoints
//!
//! - GET  /enrichment/status
//! - POST /enrichment/control/:signal   (pause | resume | stop)
//! - POST /enrichment/run?full=true
//! - POST /enrichment/retry-failed/:phase

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use cadenza_common::events::EnrichmentPhase;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::models::{ControlSignal, CycleState, RunMode};
use crate::services::{publish_signal, BreakerSnapshot};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub state: CycleState,
    pub cycle_running: bool,
    pub paused: bool,
    pub breakers: Vec<BreakerSnapshot>,
}

/// GET /enrichment/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        state: orchestrator.state().await,
        cycle_running: orchestrator.is_running(),
        paused: orchestrator.control().is_paused(),
        breakers: orchestrator.breakers(),
    })
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub signal: ControlSignal,
    /// Listeners that received the signal
    pub receivers: usize,
}

/// POST /enrichment/control/:signal
///
/// Publishes on the control topic so every orchestrator instance sees it,
/// this one included.
pub async fn send_control(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let signal: ControlSignal = raw.parse().map_err(ApiError::BadRequest)?;
    let receivers = publish_signal(state.broker.as_ref(), signal).await?;
    info!(signal = %signal, receivers, "Control signal published");
    Ok(Json(ControlResponse { signal, receivers }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub accepted: bool,
    pub mode: RunMode,
}

/// POST /enrichment/run
///
/// Starts a cycle in the background. If one is already running the new
/// cycle starts when it finishes.
pub async fn run_now(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> (StatusCode, Json<RunResponse>) {
    let mode = if query.full {
        RunMode::Full
    } else {
        RunMode::Immediate
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator.run_cycle(mode).await;
    });
    info!(mode = mode.as_str(), "Enrichment run requested");

    (
        StatusCode::ACCEPTED,
        Json(RunResponse {
            accepted: true,
            mode,
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub phase: EnrichmentPhase,
    pub reset: u64,
}

/// POST /enrichment/retry-failed/:phase
pub async fn retry_failed(
    State(state): State<AppState>,
    Path(phase): Path<String>,
) -> ApiResult<Json<RetryResponse>> {
    let phase = EnrichmentPhase::ALL
        .into_iter()
        .find(|p| p.as_str() == phase)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown phase '{}'", phase)))?;

    let reset = state.orchestrator.retry_failed(phase).await?;
    Ok(Json(RetryResponse { phase, reset }))
}

pub fn enrichment_routes() -> Router<AppState> {
    Router::new()
        .route("/enrichment/status", get(get_status))
        .route("/enrichment/control/:signal", post(send_control))
        .route("/enrichment/run", post(run_now))
        .route("/enrichment/retry-failed/:phase", post(retry_failed))
}
