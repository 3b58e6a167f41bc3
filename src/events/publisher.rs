//! Broadcast fan-out of engine events.
//!
//! ```rust
//! use query_engine_host::events::{EngineEvent, EngineEventLevel, EventPublisher};
//!
//! # tokio_test::block_on(async {
//! let publisher = EventPublisher::new(16);
//! let mut events = publisher.subscribe();
//!
//! publisher.publish(EngineEvent::new(EngineEventLevel::Info, "engine ready", "query_engine"));
//! assert_eq!(events.recv().await.unwrap().message, "engine ready");
//! # });
//! ```

use super::EngineEvent;
use tokio::sync::broadcast;

/// Fan-out of engine events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Events published with no subscribers are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::constants::limits::EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEventLevel;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::default();
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(EngineEvent::new(EngineEventLevel::Info, "ignored", "test"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let publisher = EventPublisher::new(16);
        let mut receiver = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        for i in 0..3 {
            publisher.publish(EngineEvent::new(
                EngineEventLevel::Info,
                format!("event {i}"),
                "test",
            ));
        }

        for i in 0..3 {
            let event = receiver.recv().await.unwrap();
            assert_eq!(event.message, format!("event {i}"));
        }
    }
}
