//! Message broker abstraction
//!
//! Work queues (FIFO lists consumed by the analyzers) and pub/sub topics
//! (correlation responses, control signals) behind one trait. The production
//! implementation talks to Redis; `InMemoryBroker` backs tests and
//! single-process deployments.

mod memory;
mod redis;

pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Work queue consumed by the audio feature analyzer
pub const AUDIO_ANALYSIS_QUEUE: &str = "audio:analysis:queue";

/// Work queue consumed by the CLAP embedding analyzer
pub const VIBE_EMBEDDING_QUEUE: &str = "audio:clap:queue";

/// Request topic for text-to-embedding calls
pub const TEXT_EMBED_TOPIC: &str = "audio:text:embed";

/// Topic carrying operator control signals
pub const CONTROL_TOPIC: &str = "enrichment:control";

/// Per-request response topic for a request topic
pub fn response_topic(request_topic: &str, correlation_id: &str) -> String {
    format!("{}:response:{}", request_topic, correlation_id)
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker command failed: {0}")]
    Command(String),

    /// Subscription or broker already shut down
    #[error("Broker channel closed")]
    Closed,
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        BrokerError::Command(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Queue, pub/sub and key operations used by the orchestrator
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a message to the tail of a work queue
    async fn push(&self, queue: &str, message: &str) -> BrokerResult<()>;

    /// Number of messages waiting in a work queue
    async fn queue_len(&self, queue: &str) -> BrokerResult<usize>;

    /// Publish to a topic, returning the number of receivers
    async fn publish(&self, topic: &str, message: &str) -> BrokerResult<usize>;

    /// Subscribe to a topic
    ///
    /// Resolves only once the subscription is active, so a message published
    /// after this returns is delivered.
    async fn subscribe(&self, topic: &str) -> BrokerResult<Box<dyn Subscription>>;

    /// Delete every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> BrokerResult<usize>;
}

/// An active topic subscription
///
/// Dropping a subscription releases it; `close` does so explicitly and
/// reports errors.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Next message, or `None` once the subscription has ended
    async fn next_message(&mut self) -> Option<String>;

    /// Unsubscribe and release the underlying connection
    async fn close(self: Box<Self>) -> BrokerResult<()>;
}

/// Connect to the broker named by `url` (`memory://` or `redis://...`)
pub async fn connect(url: &str) -> BrokerResult<Arc<dyn MessageBroker>> {
    if url.starts_with("memory://") {
        info!("Using in-process message broker");
        return Ok(Arc::new(InMemoryBroker::new()));
    }

    let broker = RedisBroker::connect(url).await?;
    Ok(Arc::new(broker))
}
