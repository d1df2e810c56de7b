//! Generic phase batch processor
//!
//! A batch is a list of eligible subjects worked through concurrently, at most
//! `concurrency` at a time. Every item is isolated: it claims its subject with
//! a compare-and-set, runs under the per-item deadline and on failure records
//! itself and releases the subject. Nothing an item does can fail the batch.

use async_trait::async_trait;
use cadenza_common::events::{EnrichmentEvent, EnrichmentPhase};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::{EnrichmentOrchestrator, RunMode};
use crate::config::PhaseLimits;
use crate::db::{failures, subjects};
use crate::error::{EnrichResult, FailureClass, ItemError};
use crate::models::{EnrichmentStatus, NewFailure, PhaseFailure, Subject};

/// What a phase does with one claimed subject
#[async_trait]
pub(super) trait ItemAction: Send + Sync {
    fn phase(&self) -> EnrichmentPhase;

    /// Statuses a subject may be claimed from
    fn claim_from(&self) -> &'static [EnrichmentStatus];

    /// False when an external analyzer completes the subject later
    fn completes_on_success(&self) -> bool;

    /// Attempts allowed before the subject is no longer fetched
    fn max_attempts(&self) -> Option<u32>;

    /// Completed subjects become claimable again once untouched this long
    fn refresh_after(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, subject: &Subject) -> Result<(), ItemError>;
}

enum ItemResult {
    Processed,
    Failed(PhaseFailure),
    /// Claim lost to another writer
    Skipped,
    /// Pause or stop requested before the item started
    Aborted,
}

/// Totals over one or more batches of a phase
#[derive(Debug, Default)]
pub(super) struct BatchOutcome {
    pub fetched: usize,
    pub processed: usize,
    pub failures: Vec<PhaseFailure>,
    pub aborted: bool,
    /// Phase not admitted this cycle
    pub skipped: bool,
}

impl BatchOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: BatchOutcome) {
        self.fetched += other.fetched;
        self.processed += other.processed;
        self.failures.extend(other.failures);
        self.aborted |= other.aborted;
    }
}

impl EnrichmentOrchestrator {
    /// Fetch and process batches for a phase
    ///
    /// One batch normally; a full run keeps going until a batch comes back
    /// short, a control signal arrives, or the batch cap is hit.
    pub(super) async fn run_phase_batches(
        &self,
        action: &dyn ItemAction,
        mode: RunMode,
    ) -> EnrichResult<BatchOutcome> {
        let phase = action.phase();
        let limits = self.config.limits(phase);
        let max_batches = match mode {
            RunMode::Full => self.config.full_run_max_batches.max(1),
            _ => 1,
        };

        let mut total = BatchOutcome::default();
        for batch_number in 0..max_batches {
            let subjects = match action.refresh_after() {
                Some(age) => {
                    subjects::fetch_due(
                        &self.db,
                        phase,
                        age,
                        action.max_attempts(),
                        limits.batch_size,
                    )
                    .await?
                }
                None => {
                    subjects::fetch_eligible(
                        &self.db,
                        phase,
                        action.claim_from(),
                        action.max_attempts(),
                        limits.batch_size,
                    )
                    .await?
                }
            };

            if subjects.is_empty() {
                break;
            }
            let short = subjects.len() < limits.batch_size;
            debug!(
                phase = %phase,
                batch = batch_number,
                size = subjects.len(),
                "Processing batch"
            );

            let outcome = self.run_batch(action, subjects, limits).await;
            let stop = short || outcome.aborted || outcome.processed == 0;
            total.absorb(outcome);
            if stop {
                break;
            }
        }

        Ok(total)
    }

    async fn run_batch(
        &self,
        action: &dyn ItemAction,
        subjects: Vec<Subject>,
        limits: PhaseLimits,
    ) -> BatchOutcome {
        let semaphore = Arc::new(Semaphore::new(limits.concurrency.max(1)));
        let mut outcome = BatchOutcome {
            fetched: subjects.len(),
            ..Default::default()
        };

        let mut in_flight = FuturesUnordered::new();
        for subject in subjects {
            let semaphore = Arc::clone(&semaphore);
            in_flight.push(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return ItemResult::Aborted;
                };
                self.process_item(action, subject).await
            });
        }

        while let Some(result) = in_flight.next().await {
            match result {
                ItemResult::Processed => outcome.processed += 1,
                ItemResult::Failed(failure) => outcome.failures.push(failure),
                ItemResult::Skipped => {}
                ItemResult::Aborted => outcome.aborted = true,
            }
        }

        outcome
    }

    async fn process_item(&self, action: &dyn ItemAction, mut subject: Subject) -> ItemResult {
        let phase = action.phase();

        if self.control.halt_signal().is_some() {
            return ItemResult::Aborted;
        }

        let claimed = match action.refresh_after() {
            Some(age) => subjects::claim_due(&self.db, phase, &subject.id, age).await,
            None => subjects::claim(&self.db, phase, &subject.id, action.claim_from()).await,
        };
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                debug!(phase = %phase, subject = %subject.id, "Subject claimed elsewhere");
                return ItemResult::Skipped;
            }
            Err(e) => {
                let error = ItemError::from(e);
                return ItemResult::Failed(PhaseFailure::new(phase, &subject, &error));
            }
        }
        if subject.status == EnrichmentStatus::Completed {
            // A due refresh starts over
            subject.retry_count = 0;
            subject.last_error = None;
        }

        let timeout = self.config.item_timeout();
        let result = match tokio::time::timeout(timeout, action.execute(&subject)).await {
            Ok(result) => result,
            Err(_) => Err(ItemError::timeout(timeout)),
        };

        match result {
            Ok(()) => {
                if action.completes_on_success() {
                    if let Err(e) = subjects::complete(&self.db, phase, &subject.id).await {
                        let error = ItemError::from(e);
                        self.release_failed(action, &subject, &error).await;
                        return ItemResult::Failed(PhaseFailure::new(phase, &subject, &error));
                    }
                    self.resolve_logged_failure(phase, &subject).await;
                }
                ItemResult::Processed
            }
            Err(error) => {
                self.release_failed(action, &subject, &error).await;
                ItemResult::Failed(PhaseFailure::new(phase, &subject, &error))
            }
        }
    }

    /// Return a failed subject to `pending` and record the failure
    async fn release_failed(&self, action: &dyn ItemAction, subject: &Subject, error: &ItemError) {
        let phase = action.phase();
        let retry_count = if action.max_attempts().is_some() {
            subject.retry_count.saturating_add(1)
        } else {
            subject.retry_count
        };

        if let Err(e) =
            subjects::release(&self.db, phase, &subject.id, retry_count, &error.message).await
        {
            warn!(phase = %phase, subject = %subject.id, "Failed to release subject: {}", e);
        }

        let failure = PhaseFailure::new(phase, subject, error);
        let entry = NewFailure::from_phase_failure(&failure);
        if let Err(e) = failures::record_failure(&self.db, &entry).await {
            warn!(phase = %phase, subject = %subject.id, "Failed to log failure: {}", e);
        }

        if error.code.class() == FailureClass::System {
            error!(
                phase = %phase,
                subject = %subject.id,
                code = %error.code,
                "Item failed in the store: {}",
                error.message
            );
        } else {
            warn!(
                phase = %phase,
                subject = %subject.id,
                name = %subject.name,
                code = %error.code,
                "Enrichment item failed: {}",
                error.message
            );
        }
        self.event_bus.emit_lossy(EnrichmentEvent::SubjectFailed {
            phase,
            entity_id: subject.id.clone(),
            entity_name: subject.name.clone(),
            error_code: error.code.to_string(),
            permanent: false,
            timestamp: Utc::now(),
        });
    }

    async fn resolve_logged_failure(&self, phase: EnrichmentPhase, subject: &Subject) {
        if subject.retry_count == 0 && subject.last_error.is_none() {
            return;
        }
        let entity_type = subject.entity_type.as_str();
        if let Err(e) =
            failures::resolve_entity_phase(&self.db, entity_type, &subject.id, phase).await
        {
            debug!(phase = %phase, subject = %subject.id, "Failed to resolve logged failure: {}", e);
        }
    }
}
