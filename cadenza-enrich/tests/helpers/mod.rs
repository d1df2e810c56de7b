//! Shared fixtures for cadenza-enrich integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cadenza_common::events::{EnrichmentEvent, EventBus};
use cadenza_enrich::broker::InMemoryBroker;
use cadenza_enrich::config::EnrichConfig;
use cadenza_enrich::error::EnrichResult;
use cadenza_enrich::models::Subject;
use cadenza_enrich::providers::{
    ArtistMetadata, FeedRefresh, MetadataProvider, ProviderError, SubscriptionRefresher, TrackTags,
};
use cadenza_enrich::services::{
    CompletionSummary, ControlState, EnrichmentOrchestrator, Notifier, OrchestratorServices,
};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Temporary on-disk database with the full schema
///
/// The `TempDir` must be kept alive for the duration of the test.
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = cadenza_common::db::init_database(&temp_dir.path().join("cadenza.db"))
        .await
        .unwrap();
    (temp_dir, pool)
}

pub async fn seed_artists(pool: &SqlitePool, n: usize) {
    for i in 0..n {
        sqlx::query("INSERT INTO artists (guid, name) VALUES (?, ?)")
            .bind(format!("artist-{}", i))
            .bind(format!("Artist {}", i))
            .execute(pool)
            .await
            .unwrap();
    }
}

pub async fn seed_tracks(pool: &SqlitePool, n: usize) {
    for i in 0..n {
        sqlx::query(
            "INSERT INTO tracks (guid, title, artist_name, file_path) VALUES (?, ?, 'Artist', ?)",
        )
        .bind(format!("track-{}", i))
        .bind(format!("Track {}", i))
        .bind(format!("music/track-{}.flac", i))
        .execute(pool)
        .await
        .unwrap();
    }
}

pub async fn seed_subscription(pool: &SqlitePool, id: &str, url: &str) {
    sqlx::query("INSERT INTO subscriptions (guid, title, feed_url) VALUES (?, ?, ?)")
        .bind(id)
        .bind(format!("Feed {}", id))
        .bind(url)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn seed_user(pool: &SqlitePool, id: &str) {
    sqlx::query("INSERT INTO users (guid, username) VALUES (?, ?)")
        .bind(id)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

/// Write a status column directly, as an external analyzer would
pub async fn set_status(pool: &SqlitePool, table: &str, prefix: &str, id: &str, status: &str) {
    let sql = format!("UPDATE {} SET {}_status = ? WHERE guid = ?", table, prefix);
    sqlx::query(&sql)
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

/// Age a `processing` subject past any staleness threshold
pub async fn backdate_started(pool: &SqlitePool, prefix: &str, id: &str) {
    let sql = format!("UPDATE tracks SET {}_started_at = ? WHERE guid = ?", prefix);
    sqlx::query(&sql)
        .bind(cadenza_common::time::ago(Duration::from_secs(24 * 3600)))
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn column(pool: &SqlitePool, table: &str, column: &str, id: &str) -> Option<String> {
    let sql = format!("SELECT CAST({} AS TEXT) FROM {} WHERE guid = ?", column, table);
    sqlx::query_scalar(&sql).bind(id).fetch_one(pool).await.unwrap()
}

/// Metadata provider with scripted failures, latency and a concurrency gauge
#[derive(Default)]
pub struct ScriptedProvider {
    /// Subject names that fail with a network error
    pub failing: Mutex<HashSet<String>>,
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    async fn lookup(&self, subject: &Subject) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&subject.name) {
            return Err(ProviderError::Network("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataProvider for ScriptedProvider {
    async fn artist_metadata(&self, artist: &Subject) -> Result<ArtistMetadata, ProviderError> {
        self.lookup(artist).await?;
        Ok(ArtistMetadata {
            country: Some("US".into()),
            genres: vec!["jazz".into(), "bebop".into()],
            ..Default::default()
        })
    }

    async fn track_tags(&self, track: &Subject) -> Result<TrackTags, ProviderError> {
        self.lookup(track).await?;
        Ok(TrackTags {
            recording_mbid: None,
            tags: vec!["mellow".into()],
        })
    }
}

/// Feed refresher reporting a fixed item count
pub struct StaticFeeds {
    pub items: u64,
    pub calls: AtomicUsize,
}

impl StaticFeeds {
    pub fn new(items: u64) -> Self {
        Self {
            items,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SubscriptionRefresher for StaticFeeds {
    async fn refresh(&self, _subscription: &Subject) -> Result<FeedRefresh, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FeedRefresh {
            etag: Some("\"v1\"".into()),
            item_count: Some(self.items),
        })
    }
}

/// Notifier that records every summary it is given
#[derive(Default)]
pub struct RecordingNotifier {
    pub summaries: Mutex<Vec<CompletionSummary>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.summaries.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<CompletionSummary> {
        self.summaries.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn enrichment_finished(&self, summary: &CompletionSummary) -> EnrichResult<()> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

/// Orchestration settings suited to tests: no spacing, short deadlines
pub fn test_config() -> EnrichConfig {
    EnrichConfig {
        tick_interval_ms: 20,
        min_cycle_spacing_ms: 0,
        item_timeout_ms: 2_000,
        correlation_timeout_ms: 100,
        ..Default::default()
    }
}

/// Everything an orchestrator test needs, wired to in-process fakes
pub struct Harness {
    _dir: TempDir,
    pub pool: SqlitePool,
    pub broker: InMemoryBroker,
    pub event_bus: EventBus,
    pub control: ControlState,
    pub provider: Arc<ScriptedProvider>,
    pub feeds: Arc<StaticFeeds>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<EnrichmentOrchestrator>,
}

impl Harness {
    pub async fn new(config: EnrichConfig) -> Self {
        Self::with_provider(config, ScriptedProvider::default()).await
    }

    pub async fn with_provider(config: EnrichConfig, provider: ScriptedProvider) -> Self {
        let (dir, pool) = create_test_db().await;
        let broker = InMemoryBroker::new();
        let event_bus = EventBus::new(256);
        let control = ControlState::new();
        let provider = Arc::new(provider);
        let feeds = Arc::new(StaticFeeds::new(12));
        let notifier = Arc::new(RecordingNotifier::default());

        let services = OrchestratorServices {
            metadata: provider.clone(),
            feeds: feeds.clone(),
            notifier: notifier.clone(),
        };
        let orchestrator = EnrichmentOrchestrator::new(
            pool.clone(),
            event_bus.clone(),
            Arc::new(broker.clone()),
            control.clone(),
            services,
            config,
        )
        .await
        .unwrap();

        Self {
            _dir: dir,
            pool,
            broker,
            event_bus,
            control,
            provider,
            feeds,
            notifier,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Drain every event currently buffered on a receiver
pub fn drain_events(rx: &mut broadcast::Receiver<EnrichmentEvent>) -> Vec<EnrichmentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
