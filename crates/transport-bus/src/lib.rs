//! In-process topic bus used as a stand-in local network.
//!
//! Every frame carries the id of the endpoint that published it so that
//! subscribers sharing a topic with the publisher can skip their own frames.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub origin: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers on topic {0}")]
    NoSubscribers(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes to every current subscriber and returns how many received it.
    fn publish(&self, topic: &str, origin: &str, payload: Bytes) -> BusResult<usize>;

    /// Drops the topic; subscribers observe `RecvError::Closed`.
    fn close_topic(&self, topic: &str);
}

#[derive(Debug)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, origin: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.topics.read().get(topic).cloned();
        let Some(sender) = sender else {
            return Err(BusError::NoSubscribers(topic.to_string()));
        };
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                origin: origin.to_string(),
                payload,
            })
            .map_err(|_| BusError::NoSubscribers(topic.to_string()))
    }

    fn close_topic(&self, topic: &str) {
        self.topics.write().remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_with_origin() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("tether/presence");
        let delivered = bus
            .publish("tether/presence", "peer-a", Bytes::from_static(b"hello"))
            .expect("publish ok");
        assert_eq!(delivered, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "tether/presence");
        assert_eq!(msg.origin, "peer-a");
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_reported() {
        let bus = LocalBus::new();
        let err = bus
            .publish("nobody/home", "peer-a", Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, BusError::NoSubscribers(topic) if topic == "nobody/home"));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn frames_keep_publish_order() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("ordered");
        for i in 0..10u8 {
            bus.publish("ordered", "peer-a", Bytes::from(vec![i])).unwrap();
        }
        for i in 0..10u8 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn closing_a_topic_ends_subscriptions() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("session/1");
        assert_eq!(bus.subscriber_count("session/1"), 1);
        bus.close_topic("session/1");
        assert!(matches!(
            sub.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(bus.subscriber_count("session/1"), 0);
    }
}
