//! Database initialization
//!
//! Creates the catalog tables read and written by the enrichment services.
//! Every enrichment dimension carries the same status column group:
//! `{dim}_status`, `{dim}_retry_count`, `{dim}_error`, `{dim}_started_at`,
//! `{dim}_updated_at`.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL lets the analyzers write status while the orchestrator reads
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all catalog tables (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_users_table(pool).await?;
    create_artists_table(pool).await?;
    create_tracks_table(pool).await?;
    create_audio_features_table(pool).await?;
    create_track_embeddings_table(pool).await?;
    create_subscriptions_table(pool).await?;
    create_enrichment_failures_table(pool).await?;
    create_notifications_table(pool).await?;

    info!("Catalog schema initialized");
    Ok(())
}

/// Status column group for one enrichment dimension
fn status_columns(dim: &str) -> String {
    format!(
        r#"
            {dim}_status TEXT NOT NULL DEFAULT 'pending'
                CHECK ({dim}_status IN ('pending', 'processing', 'completed', 'failed')),
            {dim}_retry_count INTEGER NOT NULL DEFAULT 0,
            {dim}_error TEXT,
            {dim}_started_at TIMESTAMP,
            {dim}_updated_at TIMESTAMP"#,
        dim = dim
    )
}

/// Create the settings table
///
/// Stores key/value pairs, including the persisted enrichment cycle state.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the users table (notification recipients)
pub async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            guid TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the artists table
pub async fn create_artists_table(pool: &SqlitePool) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            guid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            artist_mbid TEXT,
            country TEXT,
            disambiguation TEXT,
            genres TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,{}
        )
        "#,
        status_columns("enrichment")
    );
    sqlx::query(&sql).execute(pool).await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_artists_enrichment ON artists(enrichment_status, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the tracks table
///
/// Tracks carry three dimensions: `tags` (metadata), `analysis` (audio
/// features, async) and `vibe` (CLAP embedding, async).
pub async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            guid TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            artist_name TEXT,
            recording_mbid TEXT,
            file_path TEXT NOT NULL,
            tags TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,{},{},{}
        )
        "#,
        status_columns("tags"),
        status_columns("analysis"),
        status_columns("vibe")
    );
    sqlx::query(&sql).execute(pool).await?;

    for (name, column) in [
        ("idx_tracks_tags", "tags_status"),
        ("idx_tracks_analysis", "analysis_status"),
        ("idx_tracks_vibe", "vibe_status"),
    ] {
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON tracks({}, created_at)",
            name, column
        );
        sqlx::query(&index).execute(pool).await?;
    }

    Ok(())
}

/// Create the audio_features table (written by the audio analyzer)
pub async fn create_audio_features_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audio_features (
            track_id TEXT PRIMARY KEY REFERENCES tracks(guid) ON DELETE CASCADE,
            bpm REAL,
            musical_key TEXT,
            energy REAL,
            danceability REAL,
            analyzed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the track_embeddings table (written by the vibe analyzer)
pub async fn create_track_embeddings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_embeddings (
            track_id TEXT PRIMARY KEY REFERENCES tracks(guid) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            model_version TEXT NOT NULL,
            analyzed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the subscriptions table (feed subscriptions refreshed periodically)
pub async fn create_subscriptions_table(pool: &SqlitePool) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            guid TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            feed_url TEXT NOT NULL,
            etag TEXT,
            item_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,{}
        )
        "#,
        status_columns("refresh")
    );
    sqlx::query(&sql).execute(pool).await?;

    Ok(())
}

/// Create the enrichment_failures table (durable failure log)
///
/// One row per failed entity and phase; repeated failures bump `attempts`.
/// Cycle-level rows use an empty `phase` so they still collide on the key.
pub async fn create_enrichment_failures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            phase TEXT NOT NULL DEFAULT '',
            entity_name TEXT NOT NULL,
            error_message TEXT NOT NULL,
            error_code TEXT NOT NULL,
            metadata TEXT,
            attempts INTEGER NOT NULL DEFAULT 1,
            resolved INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            first_failed_at TIMESTAMP NOT NULL,
            last_failed_at TIMESTAMP NOT NULL,
            UNIQUE (entity_type, entity_id, phase)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_failures_open ON enrichment_failures(resolved, skipped, entity_type)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the notifications table
pub async fn create_notifications_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            guid TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(guid) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        let pool = memory_pool().await;
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in [
            "artists",
            "audio_features",
            "enrichment_failures",
            "notifications",
            "settings",
            "subscriptions",
            "track_embeddings",
            "tracks",
            "users",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let pool = memory_pool().await;
        create_schema(&pool).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO artists (guid, name, enrichment_status) VALUES ('a1', 'X', 'bogus')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err(), "unknown status must be rejected");
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let pool = memory_pool().await;
        create_schema(&pool).await.unwrap();

        assert_eq!(crate::db::get_setting(&pool, "k").await.unwrap(), None);
        crate::db::set_setting(&pool, "k", "v1").await.unwrap();
        crate::db::set_setting(&pool, "k", "v2").await.unwrap();
        assert_eq!(
            crate::db::get_setting(&pool, "k").await.unwrap(),
            Some("v2".to_string())
        );
    }
}
