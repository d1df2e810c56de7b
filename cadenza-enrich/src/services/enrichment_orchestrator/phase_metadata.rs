//! Metadata phases: artist metadata and track tags
//!
//! Both call the metadata provider directly and complete the subject within
//! the cycle. A provider "not found" is an answer, not a failure: the subject
//! is completed with nothing stored so it is not retried forever.

use async_trait::async_trait;
use cadenza_common::events::EnrichmentPhase;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use super::batch::{BatchOutcome, ItemAction};
use super::{EnrichmentOrchestrator, RunMode};
use crate::db::catalog;
use crate::error::{EnrichResult, ItemError};
use crate::models::{EnrichmentStatus, Subject};
use crate::providers::{MetadataProvider, ProviderError};

/// Metadata phases also pick up `failed` subjects that still have attempts left
pub(super) const CLAIMABLE: &[EnrichmentStatus] =
    &[EnrichmentStatus::Pending, EnrichmentStatus::Failed];

struct ArtistMetadataAction {
    db: SqlitePool,
    provider: Arc<dyn MetadataProvider>,
    max_attempts: u32,
}

#[async_trait]
impl ItemAction for ArtistMetadataAction {
    fn phase(&self) -> EnrichmentPhase {
        EnrichmentPhase::ArtistMetadata
    }

    fn claim_from(&self) -> &'static [EnrichmentStatus] {
        CLAIMABLE
    }

    fn completes_on_success(&self) -> bool {
        true
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }

    async fn execute(&self, artist: &Subject) -> Result<(), ItemError> {
        match self.provider.artist_metadata(artist).await {
            Ok(metadata) => {
                catalog::store_artist_metadata(&self.db, &artist.id, &metadata).await?;
                debug!(artist = %artist.name, genres = metadata.genres.len(), "Artist enriched");
                Ok(())
            }
            Err(ProviderError::NotFound(_)) => {
                debug!(artist = %artist.name, "No provider match for artist");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct TrackTagsAction {
    db: SqlitePool,
    provider: Arc<dyn MetadataProvider>,
    max_attempts: u32,
}

#[async_trait]
impl ItemAction for TrackTagsAction {
    fn phase(&self) -> EnrichmentPhase {
        EnrichmentPhase::TrackTags
    }

    fn claim_from(&self) -> &'static [EnrichmentStatus] {
        CLAIMABLE
    }

    fn completes_on_success(&self) -> bool {
        true
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }

    async fn execute(&self, track: &Subject) -> Result<(), ItemError> {
        match self.provider.track_tags(track).await {
            Ok(tags) => {
                catalog::store_track_tags(&self.db, &track.id, &tags).await?;
                debug!(track = %track.name, tags = tags.tags.len(), "Track tagged");
                Ok(())
            }
            Err(ProviderError::NotFound(_)) => {
                debug!(track = %track.name, "No provider match for track");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl EnrichmentOrchestrator {
    pub(super) async fn phase_artist_metadata(&self, mode: RunMode) -> EnrichResult<BatchOutcome> {
        let action = ArtistMetadataAction {
            db: self.db.clone(),
            provider: Arc::clone(&self.metadata),
            max_attempts: self.config.metadata_max_attempts,
        };
        self.run_phase_batches(&action, mode).await
    }

    pub(super) async fn phase_track_tags(&self, mode: RunMode) -> EnrichResult<BatchOutcome> {
        let action = TrackTagsAction {
            db: self.db.clone(),
            provider: Arc::clone(&self.metadata),
            max_attempts: self.config.metadata_max_attempts,
        };
        self.run_phase_batches(&action, mode).await
    }
}
