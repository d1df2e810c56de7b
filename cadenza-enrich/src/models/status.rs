//! Per-dimension enrichment status and its storage location

use cadenza_common::events::EnrichmentPhase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::EntityType;

/// Status of one subject in one enrichment dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Processing => "processing",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }

    /// Legal edges of the status state machine
    ///
    /// `completed -> processing` is a due subscription refresh; `failed ->
    /// pending` is an operator reset; `failed -> processing` re-admits
    /// metadata work. Nothing returns to `pending` from `completed`.
    pub fn can_transition_to(self, next: EnrichmentStatus) -> bool {
        use EnrichmentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Completed, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "processing" => Ok(EnrichmentStatus::Processing),
            "completed" => Ok(EnrichmentStatus::Completed),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => Err(format!("unknown enrichment status '{}'", other)),
        }
    }
}

/// Where a phase keeps its status column group
///
/// All identifiers are compile-time constants, so they are safe to splice
/// into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDimension {
    pub phase: EnrichmentPhase,
    pub table: &'static str,
    /// Column prefix: `{prefix}_status`, `{prefix}_retry_count`, ...
    pub prefix: &'static str,
    pub entity_type: EntityType,
    /// Expression selected as the subject's display name
    pub name_expr: &'static str,
    /// Expression selected as the subject's external identifier
    pub external_expr: &'static str,
    /// Expression selected as the subject's auxiliary value
    pub aux_expr: &'static str,
    /// Table whose row for the subject proves the async work finished
    pub artifact_table: Option<&'static str>,
}

impl StatusDimension {
    pub const fn of(phase: EnrichmentPhase) -> Self {
        match phase {
            EnrichmentPhase::ArtistMetadata => StatusDimension {
                phase,
                table: "artists",
                prefix: "enrichment",
                entity_type: EntityType::Artist,
                name_expr: "name",
                external_expr: "artist_mbid",
                aux_expr: "NULL",
                artifact_table: None,
            },
            EnrichmentPhase::TrackTags => StatusDimension {
                phase,
                table: "tracks",
                prefix: "tags",
                entity_type: EntityType::Track,
                name_expr: "title",
                external_expr: "recording_mbid",
                aux_expr: "artist_name",
                artifact_table: None,
            },
            EnrichmentPhase::AudioAnalysis => StatusDimension {
                phase,
                table: "tracks",
                prefix: "analysis",
                entity_type: EntityType::Track,
                name_expr: "title",
                external_expr: "file_path",
                aux_expr: "artist_name",
                artifact_table: Some("audio_features"),
            },
            EnrichmentPhase::VibeEmbedding => StatusDimension {
                phase,
                table: "tracks",
                prefix: "vibe",
                entity_type: EntityType::Track,
                name_expr: "title",
                external_expr: "file_path",
                aux_expr: "artist_name",
                artifact_table: Some("track_embeddings"),
            },
            EnrichmentPhase::SubscriptionRefresh => StatusDimension {
                phase,
                table: "subscriptions",
                prefix: "refresh",
                entity_type: EntityType::Subscription,
                name_expr: "title",
                external_expr: "feed_url",
                aux_expr: "etag",
                artifact_table: None,
            },
        }
    }

    pub fn status_col(&self) -> String {
        format!("{}_status", self.prefix)
    }

    pub fn retry_col(&self) -> String {
        format!("{}_retry_count", self.prefix)
    }

    pub fn error_col(&self) -> String {
        format!("{}_error", self.prefix)
    }

    pub fn started_col(&self) -> String {
        format!("{}_started_at", self.prefix)
    }

    pub fn updated_col(&self) -> String {
        format!("{}_updated_at", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnrichmentStatus::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Completed.can_transition_to(Processing));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("processing".parse::<EnrichmentStatus>(), Ok(Processing));
        assert!("done".parse::<EnrichmentStatus>().is_err());
    }

    #[test]
    fn test_dimension_columns() {
        let dim = StatusDimension::of(EnrichmentPhase::VibeEmbedding);
        assert_eq!(dim.table, "tracks");
        assert_eq!(dim.status_col(), "vibe_status");
        assert_eq!(dim.started_col(), "vibe_started_at");
        assert_eq!(dim.artifact_table, Some("track_embeddings"));

        let dim = StatusDimension::of(EnrichmentPhase::ArtistMetadata);
        assert_eq!(dim.retry_col(), "enrichment_retry_count");
        assert_eq!(dim.entity_type, EntityType::Artist);
    }
}
