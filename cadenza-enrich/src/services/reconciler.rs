//! Stale-job reconciler
//!
//! Async phases hand work to external analyzers and leave subjects in
//! `processing`. If an analyzer dies mid-job nothing ever moves them again.
//! Once per cycle the reconciler sweeps subjects that have been processing
//! longer than the phase's staleness threshold:
//!
//! - result already stored: the analyzer finished but never updated status,
//!   so the subject is completed
//! - otherwise the retry count is bumped; below the limit the subject goes
//!   back to `pending`, at the limit it becomes `failed` and one failure log
//!   entry is written
//!
//! Each reconciler exclusively owns the circuit breaker of its phase and is
//! the only code that records outcomes on it.

use cadenza_common::events::{EnrichmentEvent, EnrichmentPhase, EventBus};
use cadenza_common::time;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker, StateChange};
use crate::config::ReconcilerConfig;
use crate::db::{failures, subjects};
use crate::error::{EnrichResult, ErrorCode};
use crate::models::{NewFailure, Subject};

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Returned to `pending` for another attempt
    pub reset: usize,
    /// Moved to terminal `failed`
    pub permanently_failed: usize,
    /// Completed because the analyzer's result was found
    pub recovered: usize,
}

impl ReconcileReport {
    /// Whether the sweep found evidence of a struggling analyzer
    pub fn is_unhealthy(&self) -> bool {
        self.reset > 0 || self.permanently_failed > 0
    }
}

pub struct StaleJobReconciler {
    phase: EnrichmentPhase,
    db: SqlitePool,
    config: ReconcilerConfig,
    breaker: CircuitBreaker,
    event_bus: EventBus,
}

impl StaleJobReconciler {
    pub fn new(
        phase: EnrichmentPhase,
        db: SqlitePool,
        config: ReconcilerConfig,
        event_bus: EventBus,
    ) -> Self {
        let breaker = CircuitBreaker::new(phase, config.breaker_threshold, config.breaker_cooldown());
        Self {
            phase,
            db,
            config,
            breaker,
            event_bus,
        }
    }

    pub fn phase(&self) -> EnrichmentPhase {
        self.phase
    }

    /// Sweep stale subjects once
    pub async fn reconcile(&self) -> EnrichResult<ReconcileReport> {
        let cutoff = time::ago(self.config.stale_threshold());
        let stale = subjects::find_stale(&self.db, self.phase, cutoff).await?;

        let mut report = ReconcileReport::default();
        for subject in &stale {
            self.reconcile_subject(subject, &mut report).await?;
        }

        if report != ReconcileReport::default() {
            info!(
                phase = %self.phase,
                reset = report.reset,
                failed = report.permanently_failed,
                recovered = report.recovered,
                "Reconciled stale jobs"
            );
        }
        Ok(report)
    }

    async fn reconcile_subject(&self, subject: &Subject, report: &mut ReconcileReport) -> EnrichResult<()> {
        if subjects::artifact_exists(&self.db, self.phase, &subject.id).await? {
            if subjects::complete(&self.db, self.phase, &subject.id).await? {
                debug!(phase = %self.phase, subject = %subject.id, "Recovered finished job");
                report.recovered += 1;
            }
            return Ok(());
        }

        let attempts = subject.retry_count.saturating_add(1);
        if attempts >= self.config.max_retries {
            let message = format!(
                "Analysis abandoned after {} attempts (no result within {}s)",
                attempts,
                self.config.stale_threshold().as_secs()
            );
            // A false return means another writer moved the subject first
            if !subjects::fail(&self.db, self.phase, &subject.id, attempts, &message).await? {
                return Ok(());
            }

            failures::record_failure(
                &self.db,
                &NewFailure {
                    entity_type: subject.entity_type.as_str().to_string(),
                    entity_id: subject.id.clone(),
                    phase: Some(self.phase),
                    entity_name: subject.name.clone(),
                    error_message: message,
                    error_code: ErrorCode::MaxRetriesExceeded,
                    metadata: Some(serde_json::json!({
                        "phase": self.phase,
                        "filePath": subject.external_id,
                        "attempts": attempts,
                    })),
                },
            )
            .await?;

            self.event_bus.emit_lossy(EnrichmentEvent::SubjectFailed {
                phase: self.phase,
                entity_id: subject.id.clone(),
                entity_name: subject.name.clone(),
                error_code: ErrorCode::MaxRetriesExceeded.to_string(),
                permanent: true,
                timestamp: Utc::now(),
            });
            error!(phase = %self.phase, subject = %subject.id, attempts, "Job failed permanently");
            report.permanently_failed += 1;
        } else {
            let message = format!(
                "Timed out in processing, retry {}/{}",
                attempts, self.config.max_retries
            );
            if subjects::release(&self.db, self.phase, &subject.id, attempts, &message).await? {
                debug!(phase = %self.phase, subject = %subject.id, attempts, "Reset stale job");
                report.reset += 1;
            }
        }

        Ok(())
    }

    /// True while the breaker blocks this phase (may move it to half-open)
    pub fn breaker_open(&self) -> bool {
        let (open, change) = self.breaker.check();
        if let Some(change) = change {
            self.announce(change);
        }
        open
    }

    /// Feed one cycle's health into the breaker
    ///
    /// A cycle is unhealthy if the sweep reset or failed anything, or if any
    /// queue push failed.
    pub fn record_cycle(&self, report: &ReconcileReport, queue_failures: usize) {
        let change = if report.is_unhealthy() || queue_failures > 0 {
            self.breaker.record_failure()
        } else {
            self.breaker.record_success()
        };
        if let Some(change) = change {
            self.announce(change);
        }
    }

    fn announce(&self, change: StateChange) {
        info!(
            phase = %self.phase,
            from = %change.from,
            to = %change.to,
            failures = change.failure_count,
            "Circuit breaker state changed"
        );
        self.event_bus.emit_lossy(EnrichmentEvent::CircuitStateChanged {
            phase: self.phase,
            old_state: change.from,
            new_state: change.to,
            failure_count: change.failure_count,
            timestamp: Utc::now(),
        });
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }
}
