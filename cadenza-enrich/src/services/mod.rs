//! Business logic services for cadenza-enrich

pub mod admission;
pub mod circuit_breaker;
pub mod control;
pub mod correlation;
pub mod enrichment_orchestrator;
pub mod notifier;
pub mod reconciler;
pub mod vibe_embedder;

pub use admission::{Admission, AdmissionControl};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker};
pub use control::{publish_signal, spawn_control_listener, ControlState};
pub use correlation::{CorrelationChannel, CorrelationError};
pub use enrichment_orchestrator::{EnrichmentOrchestrator, OrchestratorServices};
pub use notifier::{CacheInvalidator, CatalogNotifier, CompletionSummary, Notifier};
pub use reconciler::{ReconcileReport, StaleJobReconciler};
pub use vibe_embedder::{EmbedError, TextEmbedding, VibeTextEmbedder, EMBEDDING_DIM};
