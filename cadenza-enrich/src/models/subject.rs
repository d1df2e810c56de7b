//! Enrichable subjects and the messages handed to analyzers

use serde::{Deserialize, Serialize};
use std::fmt;

use super::EnrichmentStatus;

/// Kind of catalog entity an enrichment dimension belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Artist,
    Track,
    Subscription,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Artist => "artist",
            EntityType::Track => "track",
            EntityType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subject as seen by one phase
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub entity_type: EntityType,
    /// Artist name, track title or subscription title
    pub name: String,
    /// MBID for metadata phases, file path for analysis phases, feed URL for
    /// subscriptions
    pub external_id: Option<String>,
    /// Artist name for tracks, ETag for subscriptions
    pub aux: Option<String>,
    pub status: EnrichmentStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Queue message consumed by the analyzers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub track_id: String,
    /// Forward-slash separated, relative to the music library root
    pub file_path: String,
}

impl WorkItem {
    pub fn new(track_id: impl Into<String>, file_path: &str) -> Self {
        Self {
            track_id: track_id.into(),
            file_path: file_path.replace('\\', "/"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_wire_format() {
        let item = WorkItem::new("t1", "Artist\\Album\\01.flac");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"trackId": "t1", "filePath": "Artist/Album/01.flac"})
        );
    }
}
