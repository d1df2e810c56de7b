//! Queue fan-out phases: audio analysis and vibe embedding
//!
//! Work for these phases runs in external analyzers. Per cycle:
//! 1. the phase's reconciler sweeps stale `processing` subjects
//! 2. admission decides whether new work may be queued
//! 3. eligible subjects are claimed, then pushed as work items
//! 4. the cycle's health is fed into the phase's circuit breaker
//!
//! A subject is claimed before its item is pushed, so a worker can never see
//! an item whose subject is still `pending`. The analyzer completes the
//! subject when it writes its result.

use async_trait::async_trait;
use cadenza_common::events::EnrichmentPhase;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::batch::{BatchOutcome, ItemAction};
use super::{EnrichmentOrchestrator, RunMode};
use crate::broker::{MessageBroker, AUDIO_ANALYSIS_QUEUE, VIBE_EMBEDDING_QUEUE};
use crate::error::{EnrichResult, ErrorCode, ItemError};
use crate::models::{EnrichmentStatus, Subject, WorkItem};
use crate::services::admission::Admission;

struct QueueFanout {
    phase: EnrichmentPhase,
    queue: &'static str,
    broker: Arc<dyn MessageBroker>,
}

#[async_trait]
impl ItemAction for QueueFanout {
    fn phase(&self) -> EnrichmentPhase {
        self.phase
    }

    fn claim_from(&self) -> &'static [EnrichmentStatus] {
        &[EnrichmentStatus::Pending]
    }

    fn completes_on_success(&self) -> bool {
        false
    }

    /// Retries of analyzer jobs are counted by the reconciler, not here
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    async fn execute(&self, track: &Subject) -> Result<(), ItemError> {
        let Some(file_path) = track.external_id.as_deref() else {
            return Err(ItemError::new(ErrorCode::StoreError, "Track has no file path"));
        };

        let item = WorkItem::new(&track.id, file_path);
        let payload = serde_json::to_string(&item)
            .map_err(|e| ItemError::new(ErrorCode::SystemError, e.to_string()))?;
        self.broker.push(self.queue, &payload).await?;
        debug!(phase = %self.phase, track = %track.id, queue = self.queue, "Queued work item");
        Ok(())
    }
}

impl EnrichmentOrchestrator {
    pub(super) async fn phase_audio_analysis(&self, mode: RunMode) -> EnrichResult<BatchOutcome> {
        self.phase_fanout(EnrichmentPhase::AudioAnalysis, AUDIO_ANALYSIS_QUEUE, mode)
            .await
    }

    pub(super) async fn phase_vibe_embedding(&self, mode: RunMode) -> EnrichResult<BatchOutcome> {
        self.phase_fanout(EnrichmentPhase::VibeEmbedding, VIBE_EMBEDDING_QUEUE, mode)
            .await
    }

    async fn phase_fanout(
        &self,
        phase: EnrichmentPhase,
        queue: &'static str,
        mode: RunMode,
    ) -> EnrichResult<BatchOutcome> {
        let reconciler = match phase {
            EnrichmentPhase::VibeEmbedding => &self.vibe_reconciler,
            _ => &self.audio_reconciler,
        };

        let report = reconciler.reconcile().await?;

        match self.admission.can_admit(phase).await? {
            Admission::Admitted => {}
            Admission::BreakerOpen => {
                info!(phase = %phase, "Circuit open, skipping phase");
                reconciler.record_cycle(&report, 0);
                return Ok(BatchOutcome::skipped());
            }
            Admission::Contended => {
                info!(phase = %phase, "Audio analysis still busy, skipping phase");
                reconciler.record_cycle(&report, 0);
                return Ok(BatchOutcome::skipped());
            }
        }

        let action = QueueFanout {
            phase,
            queue,
            broker: Arc::clone(&self.broker),
        };
        let outcome = self.run_phase_batches(&action, mode).await?;

        if !outcome.failures.is_empty() {
            warn!(phase = %phase, failed = outcome.failures.len(), "Queue pushes failed");
        }
        reconciler.record_cycle(&report, outcome.failures.len());

        Ok(outcome)
    }
}
