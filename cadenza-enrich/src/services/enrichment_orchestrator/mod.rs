//! Enrichment orchestrator
//!
//! Drives enrichment cycles. A cycle runs the phases in a fixed order:
//!
//! - ARTIST_METADATA: provider lookup per artist, completed in-cycle
//! - TRACK_TAGS: provider lookup per track, completed in-cycle
//! - AUDIO_ANALYSIS: reconcile, admit, queue work items for the audio analyzer
//! - VIBE_EMBEDDING: reconcile, admit, queue work items for the vibe analyzer
//! - SUBSCRIPTION_REFRESH: re-arm due feeds, refresh them
//!
//! then aggregates progress and handles completion. Each phase lives in its
//! own `phase_*` module as an `impl EnrichmentOrchestrator` block.
//!
//! At most one cycle runs at a time. Scheduled ticks are skipped while a
//! cycle is in flight or too soon after the last one; operator-requested
//! runs wait for the in-flight cycle and ignore spacing. Pause and stop
//! signals are checked before every phase and every item.

use cadenza_common::events::{EnrichmentEvent, EnrichmentPhase, EventBus, PhaseTally};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::MessageBroker;
use crate::config::EnrichConfig;
use crate::db::{failures, state, subjects};
use crate::error::{EnrichError, EnrichResult, ErrorCode};
use crate::models::{
    ControlSignal, CycleOutcome, CycleReport, CycleState, CycleStatus, NewFailure, PhaseFailure,
    RunMode, SkipReason,
};
use crate::providers::{MetadataProvider, SubscriptionRefresher};

use super::admission::AdmissionControl;
use super::circuit_breaker::BreakerSnapshot;
use super::control::ControlState;
use super::notifier::{CacheInvalidator, Notifier};
use super::reconciler::StaleJobReconciler;

mod batch;
mod phase_analysis;
mod phase_metadata;
mod phase_subscriptions;
mod progress;

use batch::BatchOutcome;

/// Consecutive system failures logged in full before going quiet
pub const MAX_LOGGED_SYSTEM_FAILURES: u32 = 3;

/// External collaborators of the orchestrator
pub struct OrchestratorServices {
    pub metadata: Arc<dyn MetadataProvider>,
    pub feeds: Arc<dyn SubscriptionRefresher>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct EnrichmentOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    broker: Arc<dyn MessageBroker>,
    control: ControlState,
    config: EnrichConfig,
    metadata: Arc<dyn MetadataProvider>,
    feeds: Arc<dyn SubscriptionRefresher>,
    notifier: Arc<dyn Notifier>,
    cache: CacheInvalidator,
    audio_reconciler: Arc<StaleJobReconciler>,
    vibe_reconciler: Arc<StaleJobReconciler>,
    admission: AdmissionControl,
    /// Held for the whole of a cycle
    cycle_lock: Mutex<()>,
    last_cycle_finished: std::sync::Mutex<Option<Instant>>,
    state: Mutex<CycleState>,
}

impl EnrichmentOrchestrator {
    /// Create the orchestrator, restoring persisted cycle state
    ///
    /// A state left `running` by a previous process is reset to `idle`; a
    /// persisted pause is re-applied to the control flags.
    pub async fn new(
        db: SqlitePool,
        event_bus: EventBus,
        broker: Arc<dyn MessageBroker>,
        control: ControlState,
        services: OrchestratorServices,
        config: EnrichConfig,
    ) -> EnrichResult<Self> {
        let mut persisted = state::load_cycle_state(&db).await?;
        match persisted.status {
            CycleStatus::Running => {
                warn!("Previous cycle did not finish, resetting to idle");
                persisted.status = CycleStatus::Idle;
                persisted.current_phase = None;
                state::save_cycle_state(&db, &persisted).await?;
            }
            CycleStatus::Paused => {
                info!("Enrichment was paused, staying paused");
                control.apply(ControlSignal::Pause);
            }
            CycleStatus::Idle => {}
        }

        let audio_reconciler = Arc::new(StaleJobReconciler::new(
            EnrichmentPhase::AudioAnalysis,
            db.clone(),
            config.audio_reconciler,
            event_bus.clone(),
        ));
        let vibe_reconciler = Arc::new(StaleJobReconciler::new(
            EnrichmentPhase::VibeEmbedding,
            db.clone(),
            config.vibe_reconciler,
            event_bus.clone(),
        ));
        let admission = AdmissionControl::new(
            db.clone(),
            Arc::clone(&broker),
            Arc::clone(&audio_reconciler),
            Arc::clone(&vibe_reconciler),
        );
        let cache = CacheInvalidator::new(Arc::clone(&broker), config.invalidate_cache_prefixes.clone());

        Ok(Self {
            db,
            event_bus,
            broker,
            control,
            config,
            metadata: services.metadata,
            feeds: services.feeds,
            notifier: services.notifier,
            cache,
            audio_reconciler,
            vibe_reconciler,
            admission,
            cycle_lock: Mutex::new(()),
            last_cycle_finished: std::sync::Mutex::new(None),
            state: Mutex::new(persisted),
        })
    }

    pub fn control(&self) -> &ControlState {
        &self.control
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    /// Current cycle state (a copy)
    pub async fn state(&self) -> CycleState {
        self.state.lock().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.audio_reconciler.breaker_snapshot(),
            self.vibe_reconciler.breaker_snapshot(),
        ]
    }

    /// Operator reset: return a phase's failed subjects to `pending`
    pub async fn retry_failed(&self, phase: EnrichmentPhase) -> EnrichResult<u64> {
        let reset = subjects::reset_failed(&self.db, phase).await?;
        info!(phase = %phase, reset, "Failed subjects reset for retry");
        Ok(reset)
    }

    /// Run one cycle
    ///
    /// Never fails: errors inside the cycle are logged, counted as system
    /// failures and reported as `CycleOutcome::Errored`.
    pub async fn run_cycle(&self, mode: RunMode) -> CycleReport {
        let _guard = if mode.bypasses_guards() {
            self.cycle_lock.lock().await
        } else {
            let Ok(guard) = self.cycle_lock.try_lock() else {
                debug!("Cycle already running, skipping tick");
                return CycleReport::skipped(mode, SkipReason::AlreadyRunning);
            };
            if self.control.is_paused() {
                debug!("Enrichment paused, skipping tick");
                return CycleReport::skipped(mode, SkipReason::Paused);
            }
            if self.too_soon() {
                debug!("Last cycle finished recently, skipping tick");
                return CycleReport::skipped(mode, SkipReason::TooSoon);
            }
            guard
        };

        let cycle_id = Uuid::new_v4();
        let report = match self.execute_cycle(cycle_id, mode).await {
            Ok(report) => {
                self.note_system_success().await;
                report
            }
            Err(e) => {
                self.note_system_failure(&e).await;
                CycleReport {
                    cycle_id: Some(cycle_id),
                    mode,
                    outcome: CycleOutcome::Errored(e.to_string()),
                    phases: Vec::new(),
                    failures: Vec::new(),
                }
            }
        };

        if let Ok(mut last) = self.last_cycle_finished.lock() {
            *last = Some(Instant::now());
        }
        report
    }

    fn too_soon(&self) -> bool {
        let Ok(last) = self.last_cycle_finished.lock() else {
            return false;
        };
        last.map(|t| t.elapsed() < self.config.min_cycle_spacing())
            .unwrap_or(false)
    }

    async fn execute_cycle(&self, cycle_id: Uuid, mode: RunMode) -> EnrichResult<CycleReport> {
        let started = Instant::now();
        self.update_state(|s| {
            s.status = CycleStatus::Running;
            s.current_phase = None;
            s.last_cycle_id = Some(cycle_id);
            s.last_cycle_started_at = Some(Utc::now());
        })
        .await?;

        info!(cycle_id = %cycle_id, mode = mode.as_str(), "Enrichment cycle started");
        self.event_bus.emit_lossy(EnrichmentEvent::CycleStarted {
            cycle_id,
            mode: mode.as_str().to_string(),
            timestamp: Utc::now(),
        });

        let mut tallies: Vec<PhaseTally> = Vec::new();
        let mut failures: Vec<PhaseFailure> = Vec::new();
        let mut halted = None;

        for phase in EnrichmentPhase::ALL {
            if let Some(signal) = self.control.halt_signal() {
                halted = Some(signal);
                break;
            }

            self.update_state(|s| s.current_phase = Some(phase)).await?;
            let phase_started = Instant::now();
            let outcome = self.run_phase(phase, mode).await;

            let tally = PhaseTally {
                phase,
                processed: outcome.processed,
                failed: outcome.failures.len(),
                skipped: outcome.skipped,
            };
            debug!(
                phase = %phase,
                processed = tally.processed,
                failed = tally.failed,
                skipped = tally.skipped,
                "Phase finished"
            );
            self.event_bus.emit_lossy(EnrichmentEvent::PhaseCompleted {
                cycle_id,
                tally: tally.clone(),
                duration_ms: phase_started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });

            tallies.push(tally);
            failures.extend(outcome.failures);
            if outcome.aborted {
                halted = self.control.halt_signal();
                if halted.is_some() {
                    break;
                }
            }
        }

        self.update_progress(failures.len(), halted.is_none()).await?;

        let status = match halted {
            Some(ControlSignal::Pause) => CycleStatus::Paused,
            Some(ControlSignal::Stop) => {
                self.control.clear_stop();
                CycleStatus::Idle
            }
            _ => CycleStatus::Idle,
        };
        self.update_state(|s| {
            s.status = status;
            s.current_phase = None;
            s.last_cycle_finished_at = Some(Utc::now());
        })
        .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        match halted {
            Some(signal) => info!(cycle_id = %cycle_id, signal = %signal, duration_ms, "Enrichment cycle halted"),
            None => info!(
                cycle_id = %cycle_id,
                processed = tallies.iter().map(|t| t.processed).sum::<usize>(),
                failed = failures.len(),
                duration_ms,
                "Enrichment cycle completed"
            ),
        }
        self.event_bus.emit_lossy(EnrichmentEvent::CycleCompleted {
            cycle_id,
            phases: tallies.clone(),
            halted_by: halted.map(|s| s.to_string()),
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(CycleReport {
            cycle_id: Some(cycle_id),
            mode,
            outcome: match halted {
                Some(signal) => CycleOutcome::Halted(signal),
                None => CycleOutcome::Completed,
            },
            phases: tallies,
            failures,
        })
    }

    /// Run one phase; a phase error is logged and never aborts the cycle
    async fn run_phase(&self, phase: EnrichmentPhase, mode: RunMode) -> BatchOutcome {
        let result = match phase {
            EnrichmentPhase::ArtistMetadata => self.phase_artist_metadata(mode).await,
            EnrichmentPhase::TrackTags => self.phase_track_tags(mode).await,
            EnrichmentPhase::AudioAnalysis => self.phase_audio_analysis(mode).await,
            EnrichmentPhase::VibeEmbedding => self.phase_vibe_embedding(mode).await,
            EnrichmentPhase::SubscriptionRefresh => self.phase_subscription_refresh(mode).await,
        };

        result.unwrap_or_else(|e| {
            error!(phase = %phase, error = %e, "Phase failed");
            BatchOutcome::default()
        })
    }

    async fn update_state<F>(&self, apply: F) -> EnrichResult<()>
    where
        F: FnOnce(&mut CycleState),
    {
        let mut state = self.state.lock().await;
        apply(&mut state);
        state::save_cycle_state(&self.db, &state).await
    }

    async fn note_system_success(&self) {
        let mut state = self.state.lock().await;
        if state.consecutive_system_failures == 0 {
            return;
        }
        info!(
            after = state.consecutive_system_failures,
            "Enrichment cycles recovered"
        );
        state.consecutive_system_failures = 0;
        if let Err(e) = state::save_cycle_state(&self.db, &state).await {
            debug!("Failed to persist cycle state: {}", e);
        }
    }

    /// Count a cycle-level failure, logging only the first few in a row
    async fn note_system_failure(&self, err: &EnrichError) {
        let mut state = self.state.lock().await;
        state.consecutive_system_failures = state.consecutive_system_failures.saturating_add(1);
        state.status = if self.control.is_paused() {
            CycleStatus::Paused
        } else {
            CycleStatus::Idle
        };
        state.current_phase = None;
        let count = state.consecutive_system_failures;

        if count <= MAX_LOGGED_SYSTEM_FAILURES {
            error!(consecutive = count, error = %err, "Enrichment cycle failed");
            if count == MAX_LOGGED_SYSTEM_FAILURES {
                warn!("Suppressing further cycle failure reports until a cycle succeeds");
            }
            let failure = NewFailure {
                entity_type: "system".to_string(),
                entity_id: "enrichment_cycle".to_string(),
                phase: None,
                entity_name: "Enrichment cycle".to_string(),
                error_message: err.to_string(),
                error_code: ErrorCode::SystemError,
                metadata: Some(serde_json::json!({ "consecutive": count })),
            };
            if let Err(e) = failures::record_failure(&self.db, &failure).await {
                debug!("Failed to log cycle failure: {}", e);
            }
        } else {
            debug!(consecutive = count, error = %err, "Enrichment cycle failed");
        }

        if let Err(e) = state::save_cycle_state(&self.db, &state).await {
            debug!("Failed to persist cycle state: {}", e);
        }
    }

    /// Tick until cancelled, running a scheduled cycle on every tick
    pub async fn run_forever(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_ms = self.config.tick_interval_ms,
            "Enrichment scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.run_cycle(RunMode::Scheduled).await;
            if report.ran() {
                debug!(processed = report.total_processed(), "Scheduled cycle done");
            }
        }

        info!("Enrichment scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, AUDIO_ANALYSIS_QUEUE, VIBE_EMBEDDING_QUEUE};
    use crate::db::test_support::{insert_artist, insert_track, memory_pool};
    use crate::models::{EnrichmentStatus, Subject, WorkItem};
    use crate::providers::{ArtistMetadata, FeedRefresh, ProviderError, TrackTags};
    use crate::services::notifier::CompletionSummary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubProvider {
        fail_artists: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataProvider for StubProvider {
        async fn artist_metadata(&self, _artist: &Subject) -> Result<ArtistMetadata, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_artists {
                return Err(ProviderError::Network("connection refused".into()));
            }
            Ok(ArtistMetadata {
                genres: vec!["jazz".into()],
                ..Default::default()
            })
        }

        async fn track_tags(&self, _track: &Subject) -> Result<TrackTags, ProviderError> {
            Err(ProviderError::NotFound("recording".into()))
        }
    }

    struct NoFeeds;

    #[async_trait]
    impl SubscriptionRefresher for NoFeeds {
        async fn refresh(&self, _s: &Subject) -> Result<FeedRefresh, ProviderError> {
            Ok(FeedRefresh::default())
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn enrichment_finished(&self, _summary: &CompletionSummary) -> EnrichResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        pool: SqlitePool,
        broker: InMemoryBroker,
        notifier: Arc<CountingNotifier>,
        orchestrator: EnrichmentOrchestrator,
    }

    async fn fixture(provider: StubProvider) -> Fixture {
        let pool = memory_pool().await;
        let broker = InMemoryBroker::new();
        let notifier = Arc::new(CountingNotifier::default());
        let services = OrchestratorServices {
            metadata: Arc::new(provider),
            feeds: Arc::new(NoFeeds),
            notifier: notifier.clone(),
        };
        let orchestrator = EnrichmentOrchestrator::new(
            pool.clone(),
            EventBus::new(64),
            Arc::new(broker.clone()),
            ControlState::new(),
            services,
            EnrichConfig::default(),
        )
        .await
        .unwrap();
        Fixture {
            pool,
            broker,
            notifier,
            orchestrator,
        }
    }

    async fn status(pool: &SqlitePool, phase: EnrichmentPhase, id: &str) -> EnrichmentStatus {
        subjects::get_subject(pool, phase, id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_cycle_runs_phases_in_order() {
        let f = fixture(StubProvider::default()).await;
        insert_artist(&f.pool, "a1", "Miles").await;
        insert_track(&f.pool, "t1", "So What", "C:\\music\\so_what.flac").await;

        let report = f.orchestrator.run_cycle(RunMode::Immediate).await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        let order: Vec<EnrichmentPhase> = report.phases.iter().map(|t| t.phase).collect();
        assert_eq!(order, EnrichmentPhase::ALL.to_vec());

        assert_eq!(status(&f.pool, EnrichmentPhase::ArtistMetadata, "a1").await, EnrichmentStatus::Completed);
        // Provider "not found" still completes the subject
        assert_eq!(status(&f.pool, EnrichmentPhase::TrackTags, "t1").await, EnrichmentStatus::Completed);
        assert_eq!(status(&f.pool, EnrichmentPhase::AudioAnalysis, "t1").await, EnrichmentStatus::Processing);

        let item: WorkItem = serde_json::from_str(&f.broker.pop(AUDIO_ANALYSIS_QUEUE).unwrap()).unwrap();
        assert_eq!(item.track_id, "t1");
        assert_eq!(item.file_path, "C:/music/so_what.flac");

        // Vibe waits while audio analysis is in flight
        assert!(report.phase(EnrichmentPhase::VibeEmbedding).unwrap().skipped);
        assert!(f.broker.queued(VIBE_EMBEDDING_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_metadata_failure_releases_with_retry() {
        let f = fixture(StubProvider {
            fail_artists: true,
            ..Default::default()
        })
        .await;
        insert_artist(&f.pool, "a1", "Miles").await;

        let report = f.orchestrator.run_cycle(RunMode::Immediate).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].code, ErrorCode::ProviderError);

        let subject = subjects::get_subject(&f.pool, EnrichmentPhase::ArtistMetadata, "a1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subject.status, EnrichmentStatus::Pending);
        assert_eq!(subject.retry_count, 1);
        assert_eq!(failures::list_unresolved(&f.pool, Some("artist"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_retries_are_bounded() {
        let provider = StubProvider {
            fail_artists: true,
            ..Default::default()
        };
        let f = fixture(provider).await;
        insert_artist(&f.pool, "a1", "Miles").await;

        for _ in 0..5 {
            f.orchestrator.run_cycle(RunMode::Immediate).await;
        }

        let subject = subjects::get_subject(&f.pool, EnrichmentPhase::ArtistMetadata, "a1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subject.retry_count, EnrichConfig::default().metadata_max_attempts);
        assert!(f.orchestrator.state().await.core_complete);
    }

    #[tokio::test]
    async fn test_scheduled_tick_respects_spacing_and_pause() {
        let f = fixture(StubProvider::default()).await;

        assert!(f.orchestrator.run_cycle(RunMode::Scheduled).await.ran());
        let report = f.orchestrator.run_cycle(RunMode::Scheduled).await;
        assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::TooSoon));

        // Operator runs ignore spacing
        assert!(f.orchestrator.run_cycle(RunMode::Immediate).await.ran());

        f.orchestrator.control().apply(ControlSignal::Pause);
        let report = f.orchestrator.run_cycle(RunMode::Scheduled).await;
        assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::Paused));
    }

    #[tokio::test]
    async fn test_stop_halts_and_clears() {
        let f = fixture(StubProvider::default()).await;
        insert_artist(&f.pool, "a1", "Miles").await;
        f.orchestrator.control().apply(ControlSignal::Stop);

        let report = f.orchestrator.run_cycle(RunMode::Immediate).await;
        assert_eq!(report.outcome, CycleOutcome::Halted(ControlSignal::Stop));
        assert!(report.phases.is_empty());
        assert!(!f.orchestrator.control().stop_requested());
        assert_eq!(f.orchestrator.state().await.status, CycleStatus::Idle);
        assert_eq!(status(&f.pool, EnrichmentPhase::ArtistMetadata, "a1").await, EnrichmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_pause_persists_across_restart() {
        let f = fixture(StubProvider::default()).await;
        f.orchestrator.control().apply(ControlSignal::Pause);
        let report = f.orchestrator.run_cycle(RunMode::Immediate).await;
        assert_eq!(report.outcome, CycleOutcome::Halted(ControlSignal::Pause));
        assert_eq!(f.orchestrator.state().await.status, CycleStatus::Paused);

        let control = ControlState::new();
        let services = OrchestratorServices {
            metadata: Arc::new(StubProvider::default()),
            feeds: Arc::new(NoFeeds),
            notifier: f.notifier.clone(),
        };
        let _restarted = EnrichmentOrchestrator::new(
            f.pool.clone(),
            EventBus::new(8),
            Arc::new(f.broker.clone()),
            control.clone(),
            services,
            EnrichConfig::default(),
        )
        .await
        .unwrap();
        assert!(control.is_paused());
    }

    #[tokio::test]
    async fn test_completion_notified_once() {
        let f = fixture(StubProvider::default()).await;
        insert_artist(&f.pool, "a1", "Miles").await;

        f.orchestrator.run_cycle(RunMode::Immediate).await;
        f.orchestrator.run_cycle(RunMode::Immediate).await;

        let state = f.orchestrator.state().await;
        assert!(state.fully_complete);
        assert!(state.completion_notified);
        assert_eq!(f.notifier.calls.load(Ordering::SeqCst), 1);

        // New work starts a new session
        insert_artist(&f.pool, "a2", "Coltrane").await;
        f.orchestrator.run_cycle(RunMode::Immediate).await;
        assert_eq!(f.notifier.calls.load(Ordering::SeqCst), 2);
    }
}
