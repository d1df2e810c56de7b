//! Third-party data providers used by the synchronous phases
//!
//! The orchestrator talks to providers only through these traits so that
//! tests can substitute scripted implementations.

mod feeds;
mod musicbrainz;

pub use feeds::HttpFeedRefresher;
pub use musicbrainz::MusicBrainzClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Subject;

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Artist fields filled by a metadata provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistMetadata {
    pub mbid: Option<String>,
    pub country: Option<String>,
    pub disambiguation: Option<String>,
    pub genres: Vec<String>,
}

/// Track tags from a metadata provider, strongest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTags {
    pub recording_mbid: Option<String>,
    pub tags: Vec<String>,
}

/// Result of refreshing one feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRefresh {
    /// Validator to send next time
    pub etag: Option<String>,
    /// `None` when the feed was unchanged
    pub item_count: Option<u64>,
}

/// Source of artist and track metadata
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn artist_metadata(&self, artist: &Subject) -> Result<ArtistMetadata, ProviderError>;

    async fn track_tags(&self, track: &Subject) -> Result<TrackTags, ProviderError>;
}

/// Fetches subscription feeds
#[async_trait]
pub trait SubscriptionRefresher: Send + Sync {
    async fn refresh(&self, subscription: &Subject) -> Result<FeedRefresh, ProviderError>;
}
