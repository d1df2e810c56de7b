//! Text embedding endpoint
//!
//! Forwards text to the CLAP analyzer over the correlation channel. An
//! unreachable or slow analyzer is reported as 503, not as a server error.

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::services::TextEmbedding;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub text: String,
}

/// POST /vibe/embed
pub async fn embed_text(
    State(state): State<AppState>,
    Json(request): Json<EmbedRequest>,
) -> ApiResult<Json<TextEmbedding>> {
    let embedding = state.embedder.embed_text(&request.text).await?;
    Ok(Json(embedding))
}

pub fn vibe_routes() -> Router<AppState> {
    Router::new().route("/vibe/embed", post(embed_text))
}
