//! Text-to-embedding calls against the CLAP analyzer

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::correlation::{CorrelationChannel, CorrelationError};

/// Length of every CLAP embedding vector
pub const EMBEDDING_DIM: usize = 1024;

/// Longest accepted query text, in characters
pub const MAX_TEXT_LEN: usize = 1000;

#[derive(Debug, Serialize)]
struct TextEmbedRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEmbedding {
    pub embedding: Vec<f32>,
    pub model_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("Invalid text: {0}")]
    InvalidText(String),

    #[error(transparent)]
    Channel(#[from] CorrelationError),
}

pub struct VibeTextEmbedder {
    channel: CorrelationChannel,
    timeout: Duration,
}

impl VibeTextEmbedder {
    pub fn new(channel: CorrelationChannel, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Embed free text into the same space as track embeddings
    pub async fn embed_text(&self, text: &str) -> Result<TextEmbedding, EmbedError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbedError::InvalidText("text is empty".into()));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(EmbedError::InvalidText(format!(
                "text longer than {} characters",
                MAX_TEXT_LEN
            )));
        }

        let embedding: TextEmbedding = self
            .channel
            .call(&TextEmbedRequest { text }, self.timeout)
            .await?;

        if embedding.embedding.len() != EMBEDDING_DIM {
            return Err(CorrelationError::Malformed(format!(
                "expected {} dimensions, got {}",
                EMBEDDING_DIM,
                embedding.embedding.len()
            ))
            .into());
        }

        debug!(model = %embedding.model_version, "Text embedded");
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, TEXT_EMBED_TOPIC};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_empty_text_rejected_without_call() {
        let broker = InMemoryBroker::new();
        let embedder = VibeTextEmbedder::new(
            CorrelationChannel::new(Arc::new(broker.clone()), TEXT_EMBED_TOPIC),
            Duration::from_millis(50),
        );

        let result = embedder.embed_text("   ").await;
        assert!(matches!(result, Err(EmbedError::InvalidText(_))));
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_missing_analyzer_times_out() {
        let broker = InMemoryBroker::new();
        let embedder = VibeTextEmbedder::new(
            CorrelationChannel::new(Arc::new(broker.clone()), TEXT_EMBED_TOPIC),
            Duration::from_millis(50),
        );

        let result = embedder.embed_text("dreamy synthwave").await;
        assert!(matches!(
            result,
            Err(EmbedError::Channel(CorrelationError::TimedOut(_)))
        ));
        assert_eq!(broker.active_subscriptions(), 0);
    }
}
