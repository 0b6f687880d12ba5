//! Connection lifecycle events.
//!
//! A [`Connection`](crate::Connection) publishes [`ConnectionEvent`]s on a
//! broadcast channel. Receivers that fall behind lose the oldest events,
//! as with any `tokio::sync::broadcast` channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of a connection's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Events emitted over a connection's lifetime.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// Discovery finished and the connection is usable.
    Connected {
        address: String,
        services: usize,
        characteristics: usize,
    },
    /// A requested disconnect completed.
    Disconnected { address: String },
    /// The link dropped without a disconnect request.
    LinkLost { address: String, reason: String },
}

impl ConnectionEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::Connected { address, .. }
            | Self::Disconnected { address }
            | Self::LinkLost { address, .. } => address,
        }
    }
}

/// Receiver for connection events.
pub type EventReceiver = broadcast::Receiver<ConnectionEvent>;

/// Fan-out point for [`ConnectionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event. Having no receivers is not an error.
    pub fn send(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ConnectionEvent::LinkLost {
            address: "AA:BB:CC:DD:EE:FF".into(),
            reason: "supervision timeout".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "link_lost");
        assert_eq!(json["address"], "AA:BB:CC:DD:EE:FF");

        let back: ConnectionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_dispatcher_fanout() {
        let dispatcher = EventDispatcher::default();
        let mut first = dispatcher.subscribe();
        let mut second = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(ConnectionEvent::Disconnected {
            address: "dev".into(),
        });
        assert_eq!(first.recv().await.unwrap().address(), "dev");
        assert_eq!(second.recv().await.unwrap().address(), "dev");
    }

    #[test]
    fn test_send_without_receivers() {
        EventDispatcher::new(1).send(ConnectionEvent::Disconnected {
            address: "dev".into(),
        });
    }
}
