//! Enrichment results written back to the catalog

use sqlx::SqlitePool;

use crate::error::EnrichResult;
use crate::providers::{ArtistMetadata, FeedRefresh, TrackTags};

/// Store artist metadata, keeping existing values the provider did not return
pub async fn store_artist_metadata(
    pool: &SqlitePool,
    artist_id: &str,
    metadata: &ArtistMetadata,
) -> EnrichResult<()> {
    let genres = if metadata.genres.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&metadata.genres)?)
    };

    sqlx::query(
        r#"
        UPDATE artists SET
            artist_mbid = COALESCE(?, artist_mbid),
            country = COALESCE(?, country),
            disambiguation = COALESCE(?, disambiguation),
            genres = COALESCE(?, genres)
        WHERE guid = ?
        "#,
    )
    .bind(&metadata.mbid)
    .bind(&metadata.country)
    .bind(&metadata.disambiguation)
    .bind(genres)
    .bind(artist_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn store_track_tags(
    pool: &SqlitePool,
    track_id: &str,
    tags: &TrackTags,
) -> EnrichResult<()> {
    let tag_json = serde_json::to_string(&tags.tags)?;

    sqlx::query(
        r#"
        UPDATE tracks SET
            recording_mbid = COALESCE(?, recording_mbid),
            tags = ?
        WHERE guid = ?
        "#,
    )
    .bind(&tags.recording_mbid)
    .bind(tag_json)
    .bind(track_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Store the validator and item count from a feed refresh
///
/// A 304 response leaves `item_count` as it was.
pub async fn store_feed_refresh(
    pool: &SqlitePool,
    subscription_id: &str,
    refresh: &FeedRefresh,
) -> EnrichResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions SET
            etag = COALESCE(?, etag),
            item_count = COALESCE(?, item_count)
        WHERE guid = ?
        "#,
    )
    .bind(&refresh.etag)
    .bind(refresh.item_count.map(|n| n as i64))
    .bind(subscription_id)
    .execute(pool)
    .await?;

    Ok(())
}
