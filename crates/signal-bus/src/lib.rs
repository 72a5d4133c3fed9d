use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-topic queue depth. Receivers that fall further behind lose the
/// oldest messages (best-effort delivery).
pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus has been shut down")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Topic-scoped publish/subscribe bus shared by every participant of a process.
pub trait Bus: Send + Sync {
    /// Register a new, independent subscriber for `topic`.
    fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>>;

    /// Fan `payload` out to the current subscribers of `topic`. Returns how many
    /// subscribers were reached; zero is not an error.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;

    /// Called after a subscriber for `topic` has dropped its receiver, so the
    /// topic can be forgotten once nobody listens.
    fn release(&self, topic: &str);
}

/// In-memory bus; the process-local equivalent of a browser broadcast channel.
#[derive(Debug)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
    shut_down: AtomicBool,
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
            shut_down: AtomicBool::new(false),
        }
    }

    /// Drop every topic and refuse new subscriptions. Existing receivers observe
    /// `RecvError::Closed` once their backlog drains.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.topics.write().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of topics currently held, including ones without subscribers
    /// that have not been pruned yet.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        // sweep topics whose subscribers went away without a release
        guard.retain(|name, sender| name == topic || sender.receiver_count() > 0);
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        if self.is_shut_down() {
            return Err(BusError::Closed);
        }
        Ok(self.sender_for(topic).subscribe())
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        if self.is_shut_down() {
            return Err(BusError::Closed);
        }
        let sender = match self.topics.read().get(topic) {
            Some(sender) => sender.clone(),
            None => {
                trace!(target: "signal_bus", topic, "publish to topic without subscribers");
                return Ok(0);
            }
        };
        match sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(delivered) => Ok(delivered),
            Err(_) => {
                self.release(topic);
                Ok(0)
            }
        }
    }

    fn release(&self, topic: &str) {
        let mut guard = self.topics.write();
        if guard
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            guard.remove(topic);
            trace!(target: "signal_bus", topic, "topic released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("talkspot_abc123").expect("subscribe ok");
        let delivered = bus
            .publish("talkspot_abc123", Bytes::from_static(b"ping"))
            .expect("publish ok");
        assert_eq!(delivered, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "talkspot_abc123");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = LocalBus::new();
        let delivered = bus
            .publish("talkspot_empty", Bytes::from_static(b"join"))
            .expect("publish ok");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("talkspot_a").expect("subscribe a");
        let mut b = bus.subscribe("talkspot_b").expect("subscribe b");
        bus.publish("talkspot_a", Bytes::from_static(b"for-a"))
            .expect("publish ok");
        assert_eq!(a.recv().await.expect("recv a").payload, "for-a");
        assert!(matches!(
            b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn independent_subscribers_each_receive() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("room").expect("first");
        let mut second = bus.subscribe("room").expect("second");
        assert_eq!(bus.subscriber_count("room"), 2);
        bus.publish("room", Bytes::from_static(b"hello"))
            .expect("publish ok");
        assert_eq!(first.recv().await.expect("first recv").payload, "hello");
        assert_eq!(second.recv().await.expect("second recv").payload, "hello");
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work_and_closes_receivers() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("room").expect("subscribe");
        bus.shutdown();
        assert!(matches!(bus.subscribe("room"), Err(BusError::Closed)));
        assert!(matches!(
            bus.publish("room", Bytes::from_static(b"late")),
            Err(BusError::Closed)
        ));
        assert!(matches!(
            sub.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn release_forgets_topic_once_last_subscriber_leaves() {
        let bus = LocalBus::new();
        let first = bus.subscribe("room").expect("first");
        let second = bus.subscribe("room").expect("second");
        drop(first);
        bus.release("room");
        assert_eq!(bus.topic_count(), 1);

        drop(second);
        bus.release("room");
        assert_eq!(bus.topic_count(), 0);
        // releasing an unknown topic is harmless
        bus.release("room");
    }

    #[test]
    fn subscribe_sweeps_abandoned_topics() {
        let bus = LocalBus::new();
        for n in 0..8 {
            drop(bus.subscribe(&format!("room{n}")).expect("subscribe"));
        }
        let _live = bus.subscribe("current").expect("subscribe");
        assert_eq!(bus.topic_count(), 1);
    }

    #[test]
    fn dropped_subscribers_release_topic() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("room").expect("subscribe");
        drop(sub);
        let delivered = bus
            .publish("room", Bytes::from_static(b"nobody"))
            .expect("publish ok");
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count("room"), 0);
    }
}
