//! Completion notifications and derived-cache invalidation

use async_trait::async_trait;
use cadenza_common::events::{EnrichmentEvent, EventBus, FailureTally};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::MessageBroker;
use crate::db::notifications;
use crate::error::EnrichResult;

/// Totals reported when enrichment finishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    pub artists: u64,
    pub tracks: u64,
    pub audio_analyzed: u64,
    pub vibe_embedded: u64,
    /// Open failures by entity type; empty for a clean finish
    pub failures: Vec<FailureTally>,
}

impl CompletionSummary {
    pub fn has_failures(&self) -> bool {
        self.failures.iter().any(|f| f.count > 0)
    }

    pub fn failure_total(&self) -> u64 {
        self.failures.iter().map(|f| f.count).sum()
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce that enrichment has finished for the current session
    async fn enrichment_finished(&self, summary: &CompletionSummary) -> EnrichResult<()>;
}

/// Emits the completion event and stores a notification for every user
pub struct CatalogNotifier {
    db: SqlitePool,
    event_bus: EventBus,
}

impl CatalogNotifier {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }
}

#[async_trait]
impl Notifier for CatalogNotifier {
    async fn enrichment_finished(&self, summary: &CompletionSummary) -> EnrichResult<()> {
        let timestamp = Utc::now();
        let (kind, title, message, event) = if summary.has_failures() {
            (
                "enrichment_completed_with_errors",
                "Library enrichment finished with errors",
                format!(
                    "Enriched {} artists and {} tracks; {} items could not be enriched",
                    summary.artists,
                    summary.tracks,
                    summary.failure_total()
                ),
                EnrichmentEvent::EnrichmentCompletedWithErrors {
                    artists: summary.artists,
                    tracks: summary.tracks,
                    audio_analyzed: summary.audio_analyzed,
                    vibe_embedded: summary.vibe_embedded,
                    failures: summary.failures.clone(),
                    timestamp,
                },
            )
        } else {
            (
                "enrichment_complete",
                "Library enrichment complete",
                format!(
                    "Enriched {} artists and {} tracks",
                    summary.artists, summary.tracks
                ),
                EnrichmentEvent::EnrichmentComplete {
                    artists: summary.artists,
                    tracks: summary.tracks,
                    audio_analyzed: summary.audio_analyzed,
                    vibe_embedded: summary.vibe_embedded,
                    timestamp,
                },
            )
        };

        let delivered = notifications::notify_all_users(&self.db, kind, title, &message).await?;
        info!(kind, users = delivered, "Enrichment completion announced");
        self.event_bus.emit_lossy(event);
        Ok(())
    }
}

/// Clears caches derived from enrichment data (mixes, recommendations)
pub struct CacheInvalidator {
    broker: Arc<dyn MessageBroker>,
    prefixes: Vec<String>,
}

impl CacheInvalidator {
    pub fn new(broker: Arc<dyn MessageBroker>, prefixes: Vec<String>) -> Self {
        Self { broker, prefixes }
    }

    /// Delete every key under the configured prefixes
    pub async fn invalidate(&self) -> EnrichResult<usize> {
        let mut removed = 0;
        for prefix in &self.prefixes {
            let n = self.broker.delete_prefix(prefix).await?;
            debug!(prefix = %prefix, removed = n, "Cache prefix cleared");
            removed += n;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::db::test_support::memory_pool;

    #[tokio::test]
    async fn test_notifies_each_user_with_error_variant() {
        let pool = memory_pool().await;
        for (id, name) in [("u1", "alice"), ("u2", "bob")] {
            sqlx::query("INSERT INTO users (guid, username) VALUES (?, ?)")
                .bind(id)
                .bind(name)
                .execute(&pool)
                .await
                .unwrap();
        }
        let event_bus = EventBus::new(8);
        let mut events = event_bus.subscribe();
        let notifier = CatalogNotifier::new(pool.clone(), event_bus);

        let summary = CompletionSummary {
            artists: 3,
            tracks: 10,
            failures: vec![FailureTally {
                category: "track".into(),
                count: 2,
            }],
            ..Default::default()
        };
        notifier.enrichment_finished(&summary).await.unwrap();

        let kinds: Vec<String> = sqlx::query_scalar("SELECT kind FROM notifications")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.iter().all(|k| k == "enrichment_completed_with_errors"));
        assert_eq!(events.try_recv().unwrap().event_type(), "EnrichmentCompletedWithErrors");
    }

    #[tokio::test]
    async fn test_invalidate_prefixes() {
        let broker = InMemoryBroker::new();
        broker.set_key("mixes:u1", "x");
        broker.set_key("recommendations:u1", "x");
        broker.set_key("auth:u1", "x");

        let invalidator = CacheInvalidator::new(
            Arc::new(broker.clone()),
            vec!["mixes:".into(), "recommendations:".into()],
        );
        assert_eq!(invalidator.invalidate().await.unwrap(), 2);
        assert!(broker.has_key("auth:u1"));
    }
}
