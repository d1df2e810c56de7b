//! Process-local broker

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{BrokerError, BrokerResult, MessageBroker, Subscription};

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, VecDeque<String>>,
    topics: HashMap<String, Vec<Subscriber>>,
    keys: HashMap<String, String>,
    next_subscriber_id: u64,
    closed: bool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// In-memory broker with the same delivery semantics as the Redis one
///
/// Messages published to a topic with no subscribers are dropped.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        // A poisoned lock only means another holder panicked mid-update of
        // plain collections, which stay usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pop the head of a queue (what an analyzer would consume)
    pub fn pop(&self, queue: &str) -> Option<String> {
        self.lock().queues.get_mut(queue)?.pop_front()
    }

    /// Snapshot of a queue's contents, head first
    pub fn queued(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live subscriptions across all topics
    pub fn active_subscriptions(&self) -> usize {
        self.lock().topics.values().map(Vec::len).sum()
    }

    pub fn set_key(&self, key: &str, value: &str) {
        self.lock().keys.insert(key.to_string(), value.to_string());
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.lock().keys.contains_key(key)
    }

    /// Simulate a lost connection: every later call fails and open
    /// subscriptions end
    pub fn close(&self) {
        let mut guard = self.lock();
        guard.closed = true;
        guard.topics.clear();
    }

    fn open(&self) -> BrokerResult<MutexGuard<'_, BrokerInner>> {
        let guard = self.lock();
        if guard.closed {
            return Err(BrokerError::Closed);
        }
        Ok(guard)
    }
}

fn unsubscribe(inner: &Mutex<BrokerInner>, topic: &str, id: u64) {
    let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(subscribers) = guard.topics.get_mut(topic) {
        subscribers.retain(|s| s.id != id);
        if subscribers.is_empty() {
            guard.topics.remove(topic);
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn push(&self, queue: &str, message: &str) -> BrokerResult<()> {
        self.open()?
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message.to_string());
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> BrokerResult<usize> {
        Ok(self.open()?.queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }

    async fn publish(&self, topic: &str, message: &str) -> BrokerResult<usize> {
        let guard = self.open()?;
        let delivered = guard
            .topics
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|s| s.tx.send(message.to_string()).is_ok())
                    .count()
            })
            .unwrap_or(0);
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> BrokerResult<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut guard = self.open()?;
            guard.next_subscriber_id += 1;
            let id = guard.next_subscriber_id;
            guard
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(Subscriber { id, tx });
            id
        };

        Ok(Box::new(MemorySubscription {
            id,
            topic: topic.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn delete_prefix(&self, prefix: &str) -> BrokerResult<usize> {
        let mut guard = self.open()?;
        let before = guard.keys.len();
        guard.keys.retain(|key, _| !key.starts_with(prefix));
        Ok(before - guard.keys.len())
    }
}

struct MemorySubscription {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
    inner: Arc<Mutex<BrokerInner>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    async fn close(self: Box<Self>) -> BrokerResult<()> {
        // Drop unregisters
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        unsubscribe(&self.inner, &self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let broker = InMemoryBroker::new();
        broker.push("q", "a").await.unwrap();
        broker.push("q", "b").await.unwrap();

        assert_eq!(broker.queue_len("q").await.unwrap(), 2);
        assert_eq!(broker.pop("q").as_deref(), Some("a"));
        assert_eq!(broker.pop("q").as_deref(), Some("b"));
        assert_eq!(broker.pop("q"), None);
        assert_eq!(broker.queue_len("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_active_subscribers() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.publish("t", "lost").await.unwrap(), 0);

        let mut sub = broker.subscribe("t").await.unwrap();
        assert_eq!(broker.active_subscriptions(), 1);
        assert_eq!(broker.publish("t", "hello").await.unwrap(), 1);
        assert_eq!(sub.next_message().await.as_deref(), Some("hello"));

        sub.close().await.unwrap();
        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(broker.publish("t", "after").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let broker = InMemoryBroker::new();
        {
            let _sub = broker.subscribe("t").await.unwrap();
            assert_eq!(broker.active_subscriptions(), 1);
        }
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let broker = InMemoryBroker::new();
        broker.set_key("mixes:user1", "x");
        broker.set_key("mixes:user2", "x");
        broker.set_key("session:1", "x");

        assert_eq!(broker.delete_prefix("mixes:").await.unwrap(), 2);
        assert!(!broker.has_key("mixes:user1"));
        assert!(broker.has_key("session:1"));
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_calls() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();
        broker.close();

        assert!(matches!(broker.push("q", "a").await, Err(BrokerError::Closed)));
        assert!(broker.queue_len("q").await.is_err());
        assert!(broker.publish("t", "x").await.is_err());
        assert_eq!(sub.next_message().await, None);
    }
}
