//! User notifications

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::EnrichResult;

pub async fn list_user_ids(pool: &SqlitePool) -> EnrichResult<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT guid FROM users ORDER BY created_at, guid")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Insert one notification for every user, returning how many were written
pub async fn notify_all_users(
    pool: &SqlitePool,
    kind: &str,
    title: &str,
    message: &str,
) -> EnrichResult<usize> {
    let users = list_user_ids(pool).await?;
    let mut tx = pool.begin().await?;

    for user_id in &users {
        sqlx::query(
            r#"
            INSERT INTO notifications (guid, user_id, kind, title, message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(kind)
        .bind(title)
        .bind(message)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(users.len())
}
