//! Progress aggregation and completion handling
//!
//! After every cycle the per-phase counters are collected and compared with
//! the previous snapshot. Core completion means no metadata work the phases
//! would still pick up; full completion additionally needs the audio and
//! vibe phases drained. The completion notification and cache invalidation
//! each happen at most once per session. A session starts whenever new work
//! appears.

use cadenza_common::events::{EnrichmentEvent, EnrichmentPhase, PhaseProgress};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::phase_metadata::CLAIMABLE;
use super::EnrichmentOrchestrator;
use crate::db::{failures, state, subjects};
use crate::error::EnrichResult;
use crate::models::CycleState;
use crate::services::notifier::CompletionSummary;

/// Snapshot of progress flags computed from the store
struct Completion {
    core: bool,
    full: bool,
}

impl EnrichmentOrchestrator {
    pub(super) async fn collect_progress(&self) -> EnrichResult<Vec<PhaseProgress>> {
        let mut progress = Vec::with_capacity(EnrichmentPhase::ALL.len());
        for phase in EnrichmentPhase::ALL {
            let counts = subjects::count_by_status(&self.db, phase).await?;
            progress.push(PhaseProgress { phase, counts });
        }
        Ok(progress)
    }

    async fn completion(&self, progress: &[PhaseProgress]) -> EnrichResult<Completion> {
        let max = Some(self.config.metadata_max_attempts);
        let artists =
            subjects::count_actionable(&self.db, EnrichmentPhase::ArtistMetadata, CLAIMABLE, max)
                .await?;
        let tracks =
            subjects::count_actionable(&self.db, EnrichmentPhase::TrackTags, CLAIMABLE, max)
                .await?;
        let core = artists == 0 && tracks == 0;

        let async_outstanding: u64 = progress
            .iter()
            .filter(|p| p.phase.is_async())
            .map(|p| p.counts.outstanding())
            .sum();

        Ok(Completion {
            core,
            full: core && async_outstanding == 0,
        })
    }

    /// Refresh progress after a cycle and handle completion
    ///
    /// `cycle_failures` is added to the session's failure count. Completion
    /// side effects only run when `allow_completion` is set, i.e. the cycle
    /// was not halted.
    pub(super) async fn update_progress(
        &self,
        cycle_failures: usize,
        allow_completion: bool,
    ) -> EnrichResult<()> {
        let progress = self.collect_progress().await?;
        let completion = self.completion(&progress).await?;

        let mut state = self.state.lock().await;
        let new_total: u64 = progress.iter().map(|p| p.counts.total).sum();

        if new_total > state.total_work() || (state.fully_complete && !completion.full) {
            if state.completion_notified || state.session_failures > 0 {
                info!(total = new_total, "New enrichment work, starting a new session");
            }
            state.session_failures = 0;
            state.completion_notified = false;
            state.caches_invalidated = false;
        }
        state.session_failures += cycle_failures as u64;

        let changed = state.progress != progress
            || state.core_complete != completion.core
            || state.fully_complete != completion.full;
        state.progress = progress;
        state.core_complete = completion.core;
        state.fully_complete = completion.full;

        if changed {
            debug!(
                core_complete = completion.core,
                fully_complete = completion.full,
                "Enrichment progress changed"
            );
            self.event_bus.emit_lossy(EnrichmentEvent::ProgressUpdated {
                phases: state.progress.clone(),
                core_complete: completion.core,
                fully_complete: completion.full,
                timestamp: Utc::now(),
            });
        }

        if completion.full && allow_completion {
            self.finish_session(&mut state).await;
        }

        state::save_cycle_state(&self.db, &state).await
    }

    /// Send the completion notification and clear derived caches, once each
    ///
    /// Failures are logged and retried on the next cycle.
    async fn finish_session(&self, state: &mut CycleState) {
        if !state.completion_notified {
            match self.completion_summary(state).await {
                Ok(summary) => match self.notifier.enrichment_finished(&summary).await {
                    Ok(()) => {
                        info!(
                            artists = summary.artists,
                            tracks = summary.tracks,
                            failures = summary.failure_total(),
                            "Enrichment complete"
                        );
                        state.completion_notified = true;
                    }
                    Err(e) => warn!("Failed to send completion notification: {}", e),
                },
                Err(e) => warn!("Failed to build completion summary: {}", e),
            }
        }

        if !state.caches_invalidated {
            match self.cache.invalidate().await {
                Ok(removed) => {
                    debug!(removed, "Derived caches invalidated");
                    state.caches_invalidated = true;
                }
                Err(e) => warn!("Failed to invalidate derived caches: {}", e),
            }
        }
    }

    async fn completion_summary(&self, state: &CycleState) -> EnrichResult<CompletionSummary> {
        let completed = |phase: EnrichmentPhase| {
            state
                .progress
                .iter()
                .find(|p| p.phase == phase)
                .map(|p| p.counts.completed)
                .unwrap_or(0)
        };

        Ok(CompletionSummary {
            artists: completed(EnrichmentPhase::ArtistMetadata),
            tracks: completed(EnrichmentPhase::TrackTags),
            audio_analyzed: completed(EnrichmentPhase::AudioAnalysis),
            vibe_embedded: completed(EnrichmentPhase::VibeEmbedding),
            failures: failures::count_unresolved_by_type(&self.db).await?,
        })
    }
}
