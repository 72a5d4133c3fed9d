//! Room-scoped signaling channel over the process-local bus.

use std::sync::Arc;

use bytes::Bytes;
use signal_bus::{Bus, BusError, BusMessage};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::protocol::SignalingMessage;
use crate::room::RoomToken;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling channel unavailable for {topic}: {source}")]
    Unavailable {
        topic: String,
        #[source]
        source: BusError,
    },
}

/// Opens room handles on a shared bus under a fixed namespace.
#[derive(Clone)]
pub struct SignalingChannel {
    bus: Arc<dyn Bus>,
    namespace: String,
}

impl SignalingChannel {
    pub fn new(bus: Arc<dyn Bus>, namespace: impl Into<String>) -> Self {
        Self {
            bus,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Subscribe to `room`. Each call yields an independent subscriber.
    pub fn open(&self, room: &RoomToken) -> Result<ChannelHandle, ChannelError> {
        let topic = room.channel_name(&self.namespace);
        let rx = self
            .bus
            .subscribe(&topic)
            .map_err(|source| ChannelError::Unavailable {
                topic: topic.clone(),
                source,
            })?;
        debug!(target: "talkspot::signaling", %topic, "channel opened");
        Ok(ChannelHandle {
            bus: Arc::clone(&self.bus),
            topic,
            rx: Some(rx),
        })
    }
}

/// One subscription to a room topic. Dropping or closing it unsubscribes.
pub struct ChannelHandle {
    bus: Arc<dyn Bus>,
    topic: String,
    rx: Option<broadcast::Receiver<BusMessage>>,
}

impl ChannelHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Fire-and-forget. Never reports delivery problems to the caller and is a
    /// no-op once the handle is closed.
    pub fn publish(&self, message: &SignalingMessage) {
        if self.is_closed() {
            trace!(target: "talkspot::signaling", topic = %self.topic, kind = message.kind.name(), "publish after close ignored");
            return;
        }
        let payload = match message.to_json() {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!(target: "talkspot::signaling", error = %err, "failed to encode signaling message");
                return;
            }
        };
        match self.bus.publish(&self.topic, payload) {
            Ok(delivered) => {
                trace!(target: "talkspot::signaling", topic = %self.topic, kind = message.kind.name(), delivered, "published")
            }
            Err(err) => {
                debug!(target: "talkspot::signaling", topic = %self.topic, error = %err, "publish dropped")
            }
        }
    }

    /// Next decodable message, or `None` once the handle is closed or the bus
    /// has gone away. Malformed frames and lag gaps are skipped.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(frame) => match SignalingMessage::from_json(&frame.payload) {
                    Ok(message) => return Some(message),
                    Err(err) => {
                        warn!(target: "talkspot::signaling", topic = %self.topic, error = %err, "discarding malformed signaling frame");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "talkspot::signaling", topic = %self.topic, skipped, "signaling receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.bus.release(&self.topic);
            debug!(target: "talkspot::signaling", topic = %self.topic, "channel closed");
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SignalKind;
    use crate::room::ParticipantId;
    use signal_bus::LocalBus;

    fn room() -> RoomToken {
        RoomToken::parse("abc123").expect("room")
    }

    fn join_from(sender: &str) -> SignalingMessage {
        SignalingMessage::new(SignalKind::Join, ParticipantId::new(sender), room())
    }

    #[tokio::test]
    async fn messages_reach_every_handle_in_room() {
        let bus = Arc::new(LocalBus::new());
        let channel = SignalingChannel::new(bus.clone(), "talkspot");
        let mut first = channel.open(&room()).expect("open");
        let mut second = channel.open(&room()).expect("open");
        assert_eq!(first.topic(), "talkspot_abc123");

        first.publish(&join_from("ada:1"));
        assert_eq!(first.recv().await, Some(join_from("ada:1")));
        assert_eq!(second.recv().await, Some(join_from("ada:1")));
    }

    #[tokio::test]
    async fn publisher_order_is_preserved() {
        let bus = Arc::new(LocalBus::new());
        let channel = SignalingChannel::new(bus, "talkspot");
        let publisher = channel.open(&room()).expect("open");
        let mut subscriber = channel.open(&room()).expect("open");
        let hangup = SignalingMessage::new(SignalKind::Hangup, ParticipantId::new("ada:1"), room());
        publisher.publish(&join_from("ada:1"));
        publisher.publish(&hangup);
        assert_eq!(subscriber.recv().await, Some(join_from("ada:1")));
        assert_eq!(subscriber.recv().await, Some(hangup));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_silences_publish() {
        let bus = Arc::new(LocalBus::new());
        let channel = SignalingChannel::new(bus.clone(), "talkspot");
        let mut handle = channel.open(&room()).expect("open");
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        handle.publish(&join_from("ada:1"));
        assert_eq!(handle.recv().await, None);
        assert_eq!(bus.subscriber_count("talkspot_abc123"), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn leaving_a_room_forgets_its_topic() {
        let bus = Arc::new(LocalBus::new());
        let channel = SignalingChannel::new(bus.clone(), "talkspot");
        let first = channel.open(&room()).expect("open");
        let second = channel.open(&room()).expect("open");
        drop(first);
        assert_eq!(bus.topic_count(), 1);
        drop(second);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let bus = Arc::new(LocalBus::new());
        let channel = SignalingChannel::new(bus.clone(), "talkspot");
        let mut handle = channel.open(&room()).expect("open");
        bus.publish("talkspot_abc123", Bytes::from_static(b"{not json"))
            .expect("publish");
        handle.publish(&join_from("grace:2"));
        assert_eq!(handle.recv().await, Some(join_from("grace:2")));
    }

    #[test]
    fn open_on_shut_down_bus_is_unavailable() {
        let bus = Arc::new(LocalBus::new());
        bus.shutdown();
        let channel = SignalingChannel::new(bus, "talkspot");
        assert!(matches!(
            channel.open(&room()),
            Err(ChannelError::Unavailable { .. })
        ));
    }
}
