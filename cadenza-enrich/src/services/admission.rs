//! Phase admission
//!
//! Decides, once per cycle, whether an async phase may queue new work:
//! - a phase whose circuit breaker is open is skipped
//! - vibe embedding is skipped while audio analysis is still busy, since both
//!   analyzers compete for the same CPU and GPU

use cadenza_common::events::EnrichmentPhase;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use super::reconciler::StaleJobReconciler;
use crate::broker::{MessageBroker, AUDIO_ANALYSIS_QUEUE};
use crate::db::subjects;
use crate::error::EnrichResult;

/// Admission decision for one phase in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    BreakerOpen,
    /// Another phase holds the shared analyzer resources
    Contended,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

pub struct AdmissionControl {
    db: SqlitePool,
    broker: Arc<dyn MessageBroker>,
    audio: Arc<StaleJobReconciler>,
    vibe: Arc<StaleJobReconciler>,
}

impl AdmissionControl {
    pub fn new(
        db: SqlitePool,
        broker: Arc<dyn MessageBroker>,
        audio: Arc<StaleJobReconciler>,
        vibe: Arc<StaleJobReconciler>,
    ) -> Self {
        Self {
            db,
            broker,
            audio,
            vibe,
        }
    }

    pub async fn can_admit(&self, phase: EnrichmentPhase) -> EnrichResult<Admission> {
        match phase {
            EnrichmentPhase::AudioAnalysis => {
                if self.audio.breaker_open() {
                    return Ok(Admission::BreakerOpen);
                }
                Ok(Admission::Admitted)
            }
            EnrichmentPhase::VibeEmbedding => {
                if self.vibe.breaker_open() {
                    return Ok(Admission::BreakerOpen);
                }
                if self.audio_busy().await? {
                    return Ok(Admission::Contended);
                }
                Ok(Admission::Admitted)
            }
            _ => Ok(Admission::Admitted),
        }
    }

    async fn audio_busy(&self) -> EnrichResult<bool> {
        let counts = subjects::count_by_status(&self.db, EnrichmentPhase::AudioAnalysis).await?;
        if counts.processing > 0 {
            debug!(processing = counts.processing, "Audio analysis in flight");
            return Ok(true);
        }

        let queued = self.broker.queue_len(AUDIO_ANALYSIS_QUEUE).await?;
        if queued > 0 {
            debug!(queued, "Audio analysis queue not drained");
            return Ok(true);
        }

        Ok(false)
    }
}
