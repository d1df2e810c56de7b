//! Durable failure log
//!
//! One row per (entity_type, entity_id, phase). A repeat failure of the same
//! entity in the same phase updates the message, bumps `attempts` and reopens
//! the entry. Cycle-level rows carry an empty phase.

use cadenza_common::events::{EnrichmentPhase, FailureTally};
use cadenza_common::time;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::error::{truncate_error, EnrichResult};
use crate::models::{FailureRecord, NewFailure};

/// Record a failure, upserting on the entity and phase
pub async fn record_failure(pool: &SqlitePool, failure: &NewFailure) -> EnrichResult<()> {
    let now = time::now();
    let metadata = failure
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO enrichment_failures (
            entity_type, entity_id, phase, entity_name, error_message, error_code,
            metadata, attempts, resolved, skipped, first_failed_at, last_failed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0, 0, ?, ?)
        ON CONFLICT(entity_type, entity_id, phase) DO UPDATE SET
            entity_name = excluded.entity_name,
            error_message = excluded.error_message,
            error_code = excluded.error_code,
            metadata = excluded.metadata,
            attempts = enrichment_failures.attempts + 1,
            resolved = 0,
            skipped = 0,
            last_failed_at = excluded.last_failed_at
        "#,
    )
    .bind(&failure.entity_type)
    .bind(&failure.entity_id)
    .bind(failure.phase.map(|p| p.as_str()).unwrap_or_default())
    .bind(&failure.entity_name)
    .bind(truncate_error(&failure.error_message))
    .bind(failure.error_code.as_str())
    .bind(metadata)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

fn record_from_row(row: &SqliteRow) -> EnrichResult<FailureRecord> {
    let metadata: Option<String> = row.try_get("metadata")?;
    let attempts: i64 = row.try_get("attempts")?;
    let phase: String = row.try_get("phase")?;

    Ok(FailureRecord {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        phase: (!phase.is_empty()).then_some(phase),
        entity_name: row.try_get("entity_name")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        attempts: attempts.max(0) as u32,
        resolved: row.try_get("resolved")?,
        skipped: row.try_get("skipped")?,
        first_failed_at: row.try_get("first_failed_at")?,
        last_failed_at: row.try_get("last_failed_at")?,
    })
}

/// Open failures, most recent first, optionally for one entity type
pub async fn list_unresolved(
    pool: &SqlitePool,
    entity_type: Option<&str>,
    limit: usize,
) -> EnrichResult<Vec<FailureRecord>> {
    let type_clause = if entity_type.is_some() {
        " AND entity_type = ?"
    } else {
        ""
    };
    let sql = format!(
        "SELECT id, entity_type, entity_id, phase, entity_name, error_message, error_code, \
                metadata, attempts, resolved, skipped, first_failed_at, last_failed_at \
         FROM enrichment_failures \
         WHERE resolved = 0 AND skipped = 0{} \
         ORDER BY last_failed_at DESC, id DESC \
         LIMIT ?",
        type_clause
    );

    let mut query = sqlx::query(&sql);
    if let Some(entity_type) = entity_type {
        query = query.bind(entity_type);
    }
    let rows = query.bind(limit as i64).fetch_all(pool).await?;

    rows.iter().map(record_from_row).collect()
}

/// Mark a failure resolved; false if no open entry has that id
pub async fn resolve_failure(pool: &SqlitePool, id: i64) -> EnrichResult<bool> {
    let result = sqlx::query(
        "UPDATE enrichment_failures SET resolved = 1 WHERE id = ? AND resolved = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Resolve the open entry `phase` logged for an entity, if any
///
/// Entries logged by other phases for the same entity stay open.
pub async fn resolve_entity_phase(
    pool: &SqlitePool,
    entity_type: &str,
    entity_id: &str,
    phase: EnrichmentPhase,
) -> EnrichResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE enrichment_failures SET resolved = 1
        WHERE entity_type = ? AND entity_id = ? AND phase = ? AND resolved = 0
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(phase.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a failure skipped (operator chose to ignore it)
pub async fn skip_failure(pool: &SqlitePool, id: i64) -> EnrichResult<bool> {
    let result = sqlx::query(
        "UPDATE enrichment_failures SET skipped = 1 WHERE id = ? AND skipped = 0 AND resolved = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Open failures grouped by entity type
pub async fn count_unresolved_by_type(pool: &SqlitePool) -> EnrichResult<Vec<FailureTally>> {
    let rows = sqlx::query(
        r#"
        SELECT entity_type, COUNT(*) AS n
        FROM enrichment_failures
        WHERE resolved = 0 AND skipped = 0
        GROUP BY entity_type
        ORDER BY entity_type
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> EnrichResult<FailureTally> {
            let n: i64 = row.try_get("n")?;
            Ok(FailureTally {
                category: row.try_get("entity_type")?,
                count: n.max(0) as u64,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_pool;
    use crate::error::ErrorCode;

    fn failure(entity_type: &str, id: &str, message: &str) -> NewFailure {
        NewFailure {
            entity_type: entity_type.to_string(),
            entity_id: id.to_string(),
            phase: Some(EnrichmentPhase::ArtistMetadata),
            entity_name: format!("name-{}", id),
            error_message: message.to_string(),
            error_code: ErrorCode::ProviderError,
            metadata: Some(serde_json::json!({"phase": "artist_metadata"})),
        }
    }

    #[tokio::test]
    async fn test_repeat_failure_bumps_attempts() {
        let pool = memory_pool().await;
        record_failure(&pool, &failure("artist", "a1", "first")).await.unwrap();
        record_failure(&pool, &failure("artist", "a1", "second")).await.unwrap();

        let open = list_unresolved(&pool, None, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].attempts, 2);
        assert_eq!(open[0].error_message, "second");
        assert_eq!(open[0].phase.as_deref(), Some("artist_metadata"));
        assert_eq!(
            open[0].metadata,
            Some(serde_json::json!({"phase": "artist_metadata"}))
        );
    }

    #[tokio::test]
    async fn test_resolve_and_skip() {
        let pool = memory_pool().await;
        record_failure(&pool, &failure("artist", "a1", "x")).await.unwrap();
        record_failure(&pool, &failure("track", "t1", "y")).await.unwrap();
        record_failure(&pool, &failure("track", "t2", "z")).await.unwrap();

        let tracks = list_unresolved(&pool, Some("track"), 10).await.unwrap();
        assert_eq!(tracks.len(), 2);

        assert!(resolve_failure(&pool, tracks[0].id).await.unwrap());
        assert!(!resolve_failure(&pool, tracks[0].id).await.unwrap());
        assert!(skip_failure(&pool, tracks[1].id).await.unwrap());

        let tallies = count_unresolved_by_type(&pool).await.unwrap();
        assert_eq!(
            tallies,
            vec![FailureTally {
                category: "artist".into(),
                count: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_failure_after_resolve_reopens() {
        let pool = memory_pool().await;
        record_failure(&pool, &failure("artist", "a1", "x")).await.unwrap();
        let phase = EnrichmentPhase::ArtistMetadata;
        assert!(resolve_entity_phase(&pool, "artist", "a1", phase).await.unwrap());
        assert!(list_unresolved(&pool, None, 10).await.unwrap().is_empty());

        record_failure(&pool, &failure("artist", "a1", "again")).await.unwrap();
        assert_eq!(list_unresolved(&pool, None, 10).await.unwrap().len(), 1);
    }

    fn track_failure(phase: EnrichmentPhase, code: ErrorCode, message: &str) -> NewFailure {
        NewFailure {
            entity_type: "track".to_string(),
            entity_id: "t1".to_string(),
            phase: Some(phase),
            entity_name: "Track One".to_string(),
            error_message: message.to_string(),
            error_code: code,
            metadata: Some(serde_json::json!({ "phase": phase })),
        }
    }

    #[tokio::test]
    async fn test_phases_of_one_track_are_logged_apart() {
        let pool = memory_pool().await;
        let audio = EnrichmentPhase::AudioAnalysis;
        let tags = EnrichmentPhase::TrackTags;

        record_failure(
            &pool,
            &track_failure(audio, ErrorCode::MaxRetriesExceeded, "analyzer gave up"),
        )
        .await
        .unwrap();
        record_failure(
            &pool,
            &track_failure(tags, ErrorCode::ProviderError, "tag lookup failed"),
        )
        .await
        .unwrap();

        let open = list_unresolved(&pool, Some("track"), 10).await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|f| f.attempts == 1));

        // Tags recover on the next cycle
        assert!(resolve_entity_phase(&pool, "track", "t1", tags).await.unwrap());
        assert!(!resolve_entity_phase(&pool, "track", "t1", tags).await.unwrap());

        let open = list_unresolved(&pool, Some("track"), 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].phase.as_deref(), Some("audio_analysis"));
        assert_eq!(open[0].error_code, "MAX_RETRIES_EXCEEDED");
        assert_eq!(open[0].error_message, "analyzer gave up");
    }

    #[tokio::test]
    async fn test_cycle_failures_share_one_row() {
        let pool = memory_pool().await;
        let system = |message: &str| NewFailure {
            entity_type: "system".to_string(),
            entity_id: "enrichment_cycle".to_string(),
            phase: None,
            entity_name: "Enrichment cycle".to_string(),
            error_message: message.to_string(),
            error_code: ErrorCode::SystemError,
            metadata: None,
        };

        record_failure(&pool, &system("db locked")).await.unwrap();
        record_failure(&pool, &system("db locked again")).await.unwrap();

        let open = list_unresolved(&pool, Some("system"), 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].attempts, 2);
        assert_eq!(open[0].phase, None);
    }
}
