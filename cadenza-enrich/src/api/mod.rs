//! HTTP API handlers for cadenza-enrich

pub mod enrichment;
pub mod failures;
pub mod health;
pub mod sse;
pub mod vibe;

pub use enrichment::enrichment_routes;
pub use failures::failure_routes;
pub use health::health_routes;
pub use sse::event_stream;
pub use vibe::vibe_routes;
