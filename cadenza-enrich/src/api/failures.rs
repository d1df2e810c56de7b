//! Failure log endpoints

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::failures;
use crate::error::{ApiError, ApiResult};
use crate::models::FailureRecord;
use crate::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct FailureQuery {
    /// `artist`, `track`, `subscription` or `system`
    pub entity_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FailureListResponse {
    pub failures: Vec<FailureRecord>,
}

/// GET /enrichment/failures
pub async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<FailureQuery>,
) -> ApiResult<Json<FailureListResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let failures =
        failures::list_unresolved(&state.db, query.entity_type.as_deref(), limit).await?;
    Ok(Json(FailureListResponse { failures }))
}

#[derive(Debug, Serialize)]
pub struct FailureActionResponse {
    pub id: i64,
    pub status: &'static str,
}

/// POST /enrichment/failures/:id/resolve
pub async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<FailureActionResponse>> {
    if !failures::resolve_failure(&state.db, id).await? {
        return Err(ApiError::NotFound(format!("no open failure {}", id)));
    }
    Ok(Json(FailureActionResponse {
        id,
        status: "resolved",
    }))
}

/// POST /enrichment/failures/:id/skip
pub async fn skip(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<FailureActionResponse>> {
    if !failures::skip_failure(&state.db, id).await? {
        return Err(ApiError::NotFound(format!("no open failure {}", id)));
    }
    Ok(Json(FailureActionResponse {
        id,
        status: "skipped",
    }))
}

pub fn failure_routes() -> Router<AppState> {
    Router::new()
        .route("/enrichment/failures", get(list_failures))
        .route("/enrichment/failures/:id/resolve", post(resolve))
        .route("/enrichment/failures/:id/skip", post(skip))
}
