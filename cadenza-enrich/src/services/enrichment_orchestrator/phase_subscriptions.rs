//! Subscription refresh phase
//!
//! Subscriptions are refreshed periodically rather than once. A completed
//! subscription last refreshed longer ago than the refresh interval is claimed
//! straight from `completed`.

use async_trait::async_trait;
use cadenza_common::events::EnrichmentPhase;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::batch::{BatchOutcome, ItemAction};
use super::{EnrichmentOrchestrator, RunMode};
use crate::db::catalog;
use crate::error::{EnrichResult, ItemError};
use crate::models::{EnrichmentStatus, Subject};
use crate::providers::SubscriptionRefresher;

struct RefreshAction {
    db: SqlitePool,
    refresher: Arc<dyn SubscriptionRefresher>,
    max_attempts: u32,
    interval: Duration,
}

#[async_trait]
impl ItemAction for RefreshAction {
    fn phase(&self) -> EnrichmentPhase {
        EnrichmentPhase::SubscriptionRefresh
    }

    fn claim_from(&self) -> &'static [EnrichmentStatus] {
        &[EnrichmentStatus::Pending]
    }

    fn completes_on_success(&self) -> bool {
        true
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }

    fn refresh_after(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn execute(&self, subscription: &Subject) -> Result<(), ItemError> {
        let refresh = self.refresher.refresh(subscription).await?;
        match refresh.item_count {
            Some(items) => debug!(feed = %subscription.name, items, "Feed refreshed"),
            None => debug!(feed = %subscription.name, "Feed unchanged"),
        }
        catalog::store_feed_refresh(&self.db, &subscription.id, &refresh).await?;
        Ok(())
    }
}

impl EnrichmentOrchestrator {
    pub(super) async fn phase_subscription_refresh(&self, mode: RunMode) -> EnrichResult<BatchOutcome> {
        let action = RefreshAction {
            db: self.db.clone(),
            refresher: Arc::clone(&self.feeds),
            max_attempts: self.config.metadata_max_attempts,
            interval: self.config.subscription_refresh_interval(),
        };
        let outcome = self.run_phase_batches(&action, mode).await?;
        if outcome.processed > 0 {
            info!(refreshed = outcome.processed, "Subscriptions refreshed");
        }
        Ok(outcome)
    }
}
