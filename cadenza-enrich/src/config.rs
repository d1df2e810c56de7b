//! Configuration for cadenza-enrich
//!
//! Everything is read from the service TOML file
//! (`~/.config/cadenza/cadenza-enrich.toml` unless `--config` is given).
//! All durations are milliseconds.

use cadenza_common::config::LoggingConfig;
use cadenza_common::events::EnrichmentPhase;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Service name used for the default config path and env var prefix
pub const SERVICE_NAME: &str = "cadenza-enrich";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 5790;

/// Top-level TOML file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Folder holding `cadenza.db`
    pub root_folder: Option<PathBuf>,
    pub port: Option<u16>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub musicbrainz: MusicBrainzConfig,
    #[serde(default)]
    pub enrichment: EnrichConfig,
}

/// Message broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `redis://host:port/db`, or `memory://` for a process-local broker
    #[serde(default = "default_broker_url")]
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// MusicBrainz client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicBrainzConfig {
    #[serde(default = "default_mb_base_url")]
    pub base_url: String,
    #[serde(default = "default_mb_user_agent")]
    pub user_agent: String,
    /// Minimum interval between requests (MusicBrainz allows 1/s)
    #[serde(default = "default_mb_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for MusicBrainzConfig {
    fn default() -> Self {
        Self {
            base_url: default_mb_base_url(),
            user_agent: default_mb_user_agent(),
            min_interval_ms: default_mb_interval_ms(),
        }
    }
}

fn default_mb_base_url() -> String {
    "https://musicbrainz.org/ws/2".to_string()
}

fn default_mb_user_agent() -> String {
    format!(
        "cadenza-enrich/{} ( https://github.com/cadenza-music/cadenza )",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_mb_interval_ms() -> u64 {
    1000
}

/// Batch size and parallelism for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLimits {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl PhaseLimits {
    pub const fn new(batch_size: usize, concurrency: usize) -> Self {
        Self {
            batch_size,
            concurrency,
        }
    }
}

/// Stale-job reconciliation and breaker tuning for one async phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// A `processing` subject older than this is presumed abandoned
    pub stale_threshold_ms: u64,
    /// Stale resets allowed before a subject is failed permanently
    pub max_retries: u32,
    /// Consecutive unhealthy cycles before the breaker opens
    pub breaker_threshold: u32,
    /// Time since the last failure before an open breaker probes again
    pub breaker_cooldown_ms: u64,
}

impl ReconcilerConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    /// Audio features: fast analyzer, tolerant breaker with a short cooldown
    pub fn audio_default() -> Self {
        Self {
            stale_threshold_ms: 15 * 60 * 1000,
            max_retries: 3,
            breaker_threshold: 5,
            breaker_cooldown_ms: 2 * 60 * 1000,
        }
    }

    /// CLAP embeddings: heavy model, strict breaker with a long cooldown
    pub fn vibe_default() -> Self {
        Self {
            stale_threshold_ms: 30 * 60 * 1000,
            max_retries: 3,
            breaker_threshold: 3,
            breaker_cooldown_ms: 5 * 60 * 1000,
        }
    }
}

/// `[enrichment]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    /// Scheduler tick
    pub tick_interval_ms: u64,
    /// Minimum time between the end of one scheduled cycle and the next start
    pub min_cycle_spacing_ms: u64,
    /// Per-item deadline for provider calls and queue pushes
    pub item_timeout_ms: u64,
    /// Deadline for request/response calls over the broker
    pub correlation_timeout_ms: u64,
    /// Metadata attempts before a subject is parked until an operator reset
    pub metadata_max_attempts: u32,
    /// Completed subscriptions become pending again after this long
    pub subscription_refresh_interval_ms: u64,
    /// Upper bound on batches per phase in a full run
    pub full_run_max_batches: usize,
    pub artist_metadata: PhaseLimits,
    pub track_tags: PhaseLimits,
    pub audio_analysis: PhaseLimits,
    pub vibe_embedding: PhaseLimits,
    pub subscription_refresh: PhaseLimits,
    pub audio_reconciler: ReconcilerConfig,
    pub vibe_reconciler: ReconcilerConfig,
    /// Cache key prefixes cleared once enrichment fully completes
    pub invalidate_cache_prefixes: Vec<String>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10_000,
            min_cycle_spacing_ms: 30_000,
            item_timeout_ms: 30_000,
            correlation_timeout_ms: 30_000,
            metadata_max_attempts: 3,
            subscription_refresh_interval_ms: 6 * 60 * 60 * 1000,
            full_run_max_batches: 20,
            artist_metadata: PhaseLimits::new(10, 2),
            track_tags: PhaseLimits::new(20, 3),
            audio_analysis: PhaseLimits::new(50, 5),
            vibe_embedding: PhaseLimits::new(50, 5),
            subscription_refresh: PhaseLimits::new(10, 2),
            audio_reconciler: ReconcilerConfig::audio_default(),
            vibe_reconciler: ReconcilerConfig::vibe_default(),
            invalidate_cache_prefixes: vec!["mixes:".to_string(), "recommendations:".to_string()],
        }
    }
}

impl EnrichConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn min_cycle_spacing(&self) -> Duration {
        Duration::from_millis(self.min_cycle_spacing_ms)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_millis(self.correlation_timeout_ms)
    }

    pub fn subscription_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.subscription_refresh_interval_ms)
    }

    pub fn limits(&self, phase: EnrichmentPhase) -> PhaseLimits {
        match phase {
            EnrichmentPhase::ArtistMetadata => self.artist_metadata,
            EnrichmentPhase::TrackTags => self.track_tags,
            EnrichmentPhase::AudioAnalysis => self.audio_analysis,
            EnrichmentPhase::VibeEmbedding => self.vibe_embedding,
            EnrichmentPhase::SubscriptionRefresh => self.subscription_refresh,
        }
    }
}
