//! Persisted cycle state (JSON in the settings table)

use cadenza_common::db::{get_setting, set_setting};
use sqlx::SqlitePool;
use tracing::warn;

use crate::error::EnrichResult;
use crate::models::CycleState;

const STATE_KEY: &str = "enrichment_state";

/// Load the cycle state, falling back to a fresh one if missing or unreadable
pub async fn load_cycle_state(pool: &SqlitePool) -> EnrichResult<CycleState> {
    let Some(json) = get_setting(pool, STATE_KEY).await? else {
        return Ok(CycleState::default());
    };

    match serde_json::from_str(&json) {
        Ok(state) => Ok(state),
        Err(e) => {
            warn!("Discarding unreadable enrichment state: {}", e);
            Ok(CycleState::default())
        }
    }
}

pub async fn save_cycle_state(pool: &SqlitePool, state: &CycleState) -> EnrichResult<()> {
    let json = serde_json::to_string(state)?;
    set_setting(pool, STATE_KEY, &json).await?;
    Ok(())
}
