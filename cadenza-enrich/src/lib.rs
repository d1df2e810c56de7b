//! cadenza-enrich library interface
//!
//! The enrichment orchestrator, its broker and provider seams, and the
//! operator HTTP surface. `main.rs` wires these together; integration tests
//! drive them directly.

pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use cadenza_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::broker::MessageBroker;
use crate::services::{EnrichmentOrchestrator, VibeTextEmbedder};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub broker: Arc<dyn MessageBroker>,
    pub orchestrator: Arc<EnrichmentOrchestrator>,
    pub embedder: Arc<VibeTextEmbedder>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        broker: Arc<dyn MessageBroker>,
        orchestrator: Arc<EnrichmentOrchestrator>,
        embedder: Arc<VibeTextEmbedder>,
    ) -> Self {
        Self {
            db,
            event_bus,
            broker,
            orchestrator,
            embedder,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::enrichment_routes())
        .merge(api::failure_routes())
        .merge(api::vibe_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
