//! Database access for cadenza-enrich
//!
//! Tables are created by `cadenza_common::db`; this module holds the
//! enrichment-specific queries.

pub mod catalog;
pub mod failures;
pub mod notifications;
pub mod state;
pub mod subjects;

use cadenza_common::db::init_database;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (or create) `cadenza.db` under the root folder
pub async fn init_database_pool(root_folder: &Path) -> anyhow::Result<SqlitePool> {
    let db_path = root_folder.join("cadenza.db");
    tracing::debug!("Opening database: {}", db_path.display());
    Ok(init_database(&db_path).await?)
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        cadenza_common::db::create_schema(&pool).await.unwrap();
        pool
    }

    pub async fn insert_track(pool: &SqlitePool, id: &str, title: &str, file_path: &str) {
        sqlx::query("INSERT INTO tracks (guid, title, artist_name, file_path) VALUES (?, ?, 'Artist', ?)")
            .bind(id)
            .bind(title)
            .bind(file_path)
            .execute(pool)
            .await
            .unwrap();
    }

    pub async fn insert_artist(pool: &SqlitePool, id: &str, name: &str) {
        sqlx::query("INSERT INTO artists (guid, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
    }

    /// Force a status without going through the state machine
    pub async fn set_track_status(pool: &SqlitePool, prefix: &str, id: &str, status: &str) {
        let sql = format!("UPDATE tracks SET {}_status = ? WHERE guid = ?", prefix);
        sqlx::query(&sql)
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }
}
