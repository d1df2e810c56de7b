//! Supporting types carried by enrichment events

use serde::{Deserialize, Serialize};
use std::fmt;

/// One enrichment dimension, in cycle execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentPhase {
    /// Third-party artist metadata (genres, country, disambiguation)
    ArtistMetadata,
    /// Third-party track tags
    TrackTags,
    /// Audio feature extraction, delegated to the audio analyzer
    AudioAnalysis,
    /// Semantic audio embedding, delegated to the vibe (CLAP) analyzer
    VibeEmbedding,
    /// Periodic refresh of feed subscriptions
    SubscriptionRefresh,
}

impl EnrichmentPhase {
    /// Phases in the fixed order a cycle runs them
    pub const ALL: [EnrichmentPhase; 5] = [
        EnrichmentPhase::ArtistMetadata,
        EnrichmentPhase::TrackTags,
        EnrichmentPhase::AudioAnalysis,
        EnrichmentPhase::VibeEmbedding,
        EnrichmentPhase::SubscriptionRefresh,
    ];

    /// Stable snake_case name used in logs, events and the failure log
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentPhase::ArtistMetadata => "artist_metadata",
            EnrichmentPhase::TrackTags => "track_tags",
            EnrichmentPhase::AudioAnalysis => "audio_analysis",
            EnrichmentPhase::VibeEmbedding => "vibe_embedding",
            EnrichmentPhase::SubscriptionRefresh => "subscription_refresh",
        }
    }

    /// Metadata phases complete synchronously within the cycle
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            EnrichmentPhase::ArtistMetadata | EnrichmentPhase::TrackTags
        )
    }

    /// Queue fan-out phases complete out of band, in an external analyzer
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            EnrichmentPhase::AudioAnalysis | EnrichmentPhase::VibeEmbedding
        )
    }
}

impl fmt::Display for EnrichmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status counters for one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl PhaseCounts {
    /// Subjects with work still outstanding (pending or in flight)
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing
    }
}

/// Counters for one phase, as reported in progress events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: EnrichmentPhase,
    pub counts: PhaseCounts,
}

/// Per-phase result of one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTally {
    pub phase: EnrichmentPhase,
    /// Subjects successfully processed (completed or handed to an analyzer)
    pub processed: usize,
    /// Per-item failures recorded during the phase
    pub failed: usize,
    /// Phase was not admitted this cycle (breaker open or contention)
    pub skipped: bool,
}

/// Failure count for one category in a completed-with-errors summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTally {
    /// Entity type of the failed subjects (e.g. "artist", "track")
    pub category: String,
    pub count: u64,
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, work is queued
    Closed,
    /// Failing fast, the owning phase is skipped
    Open,
    /// Cooldown elapsed, the next cycle is a probe
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}
