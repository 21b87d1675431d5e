//! In-process event bus bridging loop activity to RPC subscribers.
//!
//! This plays the role the WebSocket broadcaster used to: every iteration,
//! state transition, and PTY output line is published here, and the RPC
//! server's `subscribe` handler forwards the stream to whichever client
//! asked for it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event published to subscribers, shaped like the JSON-RPC notification
/// the RPC layer wraps it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopEvent {
    /// Event type, e.g. "iteration:started", "pty:output", "state:changed".
    pub event: String,
    pub payload: serde_json::Value,
}

impl LoopEvent {
    pub fn new(event: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            event: event.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Broadcasts loop events to every subscribed RPC connection.
///
/// Backed by a bounded broadcast channel; slow subscribers drop the oldest
/// events rather than stall the loop.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LoopEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    /// Publish an event. No-op if nobody is subscribed.
    pub fn publish(&self, event_type: &str, payload: impl Serialize) {
        let _ = self.tx.send(LoopEvent::new(event_type, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish("iteration:started", serde_json::json!({"iteration": 1}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "iteration:started");
        assert_eq!(event.payload["iteration"], 1);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish("noop", serde_json::json!({}));
    }
}
