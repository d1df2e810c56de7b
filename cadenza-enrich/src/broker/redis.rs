//! Redis-backed broker
//!
//! Commands share one `ConnectionManager`. Each subscription opens its own
//! pub/sub connection, so closing one never disturbs another.

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::fmt;
use tracing::{debug, info};

use super::{BrokerError, BrokerResult, MessageBroker, Subscription};

#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> BrokerResult<Self> {
        info!("Connecting to Redis broker at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(format!("Invalid Redis URL: {e}")))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect to Redis: {e}")))?;

        info!("Connected to Redis broker");

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn push(&self, queue: &str, message: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue, message).await?;
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    async fn publish(&self, topic: &str, message: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, message).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> BrokerResult<Box<dyn Subscription>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to open pub/sub connection: {e}")))?;

        // SUBSCRIBE returns after the server confirms
        pubsub.subscribe(topic).await?;
        debug!(topic = %topic, "Subscribed");

        Ok(Box::new(RedisSubscription {
            topic: topic.to_string(),
            pubsub,
        }))
    }

    async fn delete_prefix(&self, prefix: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);

        let keys: Vec<String> = conn.keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        debug!("Deleting {} keys matching pattern: {}", keys.len(), pattern);
        let removed: usize = conn.del(keys).await?;
        Ok(removed)
    }
}

struct RedisSubscription {
    topic: String,
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next_message(&mut self) -> Option<String> {
        loop {
            let msg = self.pubsub.on_message().next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => return Some(payload),
                Err(e) => debug!(topic = %self.topic, "Skipping undecodable message: {}", e),
            }
        }
    }

    async fn close(mut self: Box<Self>) -> BrokerResult<()> {
        self.pubsub.unsubscribe(&self.topic).await?;
        debug!(topic = %self.topic, "Unsubscribed");
        Ok(())
    }
}
