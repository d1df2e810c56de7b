//! MusicBrainz metadata provider
//!
//! Looks subjects up by MBID when the catalog has one, otherwise searches by
//! name and accepts only high-scoring matches. Requests are serialized through
//! a rate limiter (MusicBrainz allows one request per second per client).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ArtistMetadata, MetadataProvider, ProviderError, TrackTags};
use crate::config::MusicBrainzConfig;
use crate::models::Subject;

/// Minimum search score accepted as a match
const MIN_SEARCH_SCORE: u32 = 90;

/// Tags kept per track
const MAX_TAGS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
struct MBTag {
    name: String,
    #[serde(default)]
    count: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct MBArtist {
    id: String,
    country: Option<String>,
    #[serde(default)]
    disambiguation: Option<String>,
    #[serde(default)]
    genres: Vec<MBTag>,
    #[serde(default)]
    tags: Vec<MBTag>,
    #[serde(default)]
    score: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MBArtistSearch {
    #[serde(default)]
    artists: Vec<MBArtist>,
}

#[derive(Debug, Clone, Deserialize)]
struct MBRecording {
    id: String,
    #[serde(default)]
    genres: Vec<MBTag>,
    #[serde(default)]
    tags: Vec<MBTag>,
    #[serde(default)]
    score: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MBRecordingSearch {
    #[serde(default)]
    recordings: Vec<MBRecording>,
}

/// Rate limiter enforcing a minimum interval between requests
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

/// Merge genres and tags, most-voted first, without duplicates
fn rank_tags(genres: &[MBTag], tags: &[MBTag]) -> Vec<String> {
    let mut all: Vec<&MBTag> = genres.iter().chain(tags.iter()).filter(|t| t.count > 0).collect();
    all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

    let mut ranked: Vec<String> = Vec::new();
    for tag in all {
        let name = tag.name.trim().to_lowercase();
        if !name.is_empty() && !ranked.contains(&name) {
            ranked.push(name);
        }
        if ranked.len() == MAX_TAGS {
            break;
        }
    }
    ranked
}

/// Escape Lucene special characters in a search term
fn lucene_escape(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if "+-&|!(){}[]^\"~*?:\\/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// MusicBrainz API client
pub struct MusicBrainzClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter,
}

impl MusicBrainzClient {
    pub fn new(config: &MusicBrainzConfig) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter: RateLimiter::new(Duration::from_millis(config.min_interval_ms)),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        self.rate_limiter.wait().await;

        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "Querying MusicBrainz API");

        let response = self
            .http_client
            .get(&url)
            .query(query)
            .query(&[("fmt", "json")])
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();

        if status == 404 {
            return Err(ProviderError::NotFound(path.to_string()));
        }

        if status == 503 || status == 429 {
            return Err(ProviderError::RateLimited);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }

    async fn find_artist(&self, artist: &Subject) -> Result<MBArtist, ProviderError> {
        if let Some(mbid) = artist.external_id.as_deref().filter(|m| !m.is_empty()) {
            return self
                .get_json(&format!("artist/{}", mbid), &[("inc", "genres+tags")])
                .await;
        }

        let query = format!("artist:\"{}\"", lucene_escape(&artist.name));
        let search: MBArtistSearch = self
            .get_json("artist", &[("query", query.as_str()), ("limit", "1")])
            .await?;

        let best = search
            .artists
            .into_iter()
            .find(|a| a.score.unwrap_or(0) >= MIN_SEARCH_SCORE)
            .ok_or_else(|| ProviderError::NotFound(format!("artist '{}'", artist.name)))?;

        // Search results carry no genres; follow up with a lookup
        self.get_json(&format!("artist/{}", best.id), &[("inc", "genres+tags")])
            .await
    }

    async fn find_recording(&self, track: &Subject) -> Result<MBRecording, ProviderError> {
        if let Some(mbid) = track.external_id.as_deref().filter(|m| !m.is_empty()) {
            return self
                .get_json(&format!("recording/{}", mbid), &[("inc", "genres+tags")])
                .await;
        }

        let mut query = format!("recording:\"{}\"", lucene_escape(&track.name));
        if let Some(artist) = track.aux.as_deref().filter(|a| !a.is_empty()) {
            query.push_str(&format!(" AND artist:\"{}\"", lucene_escape(artist)));
        }
        let search: MBRecordingSearch = self
            .get_json("recording", &[("query", query.as_str()), ("limit", "1")])
            .await?;

        let best = search
            .recordings
            .into_iter()
            .find(|r| r.score.unwrap_or(0) >= MIN_SEARCH_SCORE)
            .ok_or_else(|| ProviderError::NotFound(format!("recording '{}'", track.name)))?;

        self.get_json(&format!("recording/{}", best.id), &[("inc", "genres+tags")])
            .await
    }
}

#[async_trait]
impl MetadataProvider for MusicBrainzClient {
    async fn artist_metadata(&self, artist: &Subject) -> Result<ArtistMetadata, ProviderError> {
        let found = self.find_artist(artist).await?;

        Ok(ArtistMetadata {
            genres: rank_tags(&found.genres, &found.tags),
            mbid: Some(found.id),
            country: found.country,
            disambiguation: found.disambiguation.filter(|d| !d.is_empty()),
        })
    }

    async fn track_tags(&self, track: &Subject) -> Result<TrackTags, ProviderError> {
        let found = self.find_recording(track).await?;

        Ok(TrackTags {
            tags: rank_tags(&found.genres, &found.tags),
            recording_mbid: Some(found.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, count: i64) -> MBTag {
        MBTag {
            name: name.to_string(),
            count,
        }
    }

    #[test]
    fn test_rank_tags_merges_and_orders() {
        let genres = vec![tag("Rock", 5), tag("indie rock", 9)];
        let tags = vec![tag("rock", 3), tag("seen live", 0), tag("90s", 2)];

        assert_eq!(rank_tags(&genres, &tags), vec!["indie rock", "rock", "90s"]);
    }

    #[test]
    fn test_lucene_escape() {
        assert_eq!(lucene_escape("AC/DC"), "AC\\/DC");
        assert_eq!(lucene_escape("Sigur Rós"), "Sigur Rós");
        assert_eq!(lucene_escape("\"Weird\" Al"), "\\\"Weird\\\" Al");
    }

    #[test]
    fn test_parse_artist_lookup() {
        let json = r#"{
            "id": "a74b1b7f-71a5-4011-9441-d0b5e4122711",
            "name": "Radiohead",
            "country": "GB",
            "disambiguation": "",
            "genres": [{"name": "alternative rock", "count": 12}],
            "tags": [{"name": "british", "count": 4}]
        }"#;
        let artist: MBArtist = serde_json::from_str(json).unwrap();
        assert_eq!(artist.country.as_deref(), Some("GB"));
        assert_eq!(
            rank_tags(&artist.genres, &artist.tags),
            vec!["alternative rock", "british"]
        );
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(40));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
