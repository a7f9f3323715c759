use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Reproducer event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproEvent {
    /// Event key (e.g., "push.completed", "run.listing")
    pub key: EventKey,

    /// Invocation that produced the event (0 for standalone phases)
    pub invocation: u32,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ReproEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, invocation: u32, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            invocation,
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>, invocation: u32) -> Self {
        Self::new(key, invocation, EventPayload::Empty)
    }

    /// Create an event with a string payload
    pub fn with_string(key: impl Into<String>, invocation: u32, message: impl Into<String>) -> Self {
        Self::new(key, invocation, EventPayload::String(message.into()))
    }

    /// Create an event with a map payload
    pub fn with_map(
        key: impl Into<String>,
        invocation: u32,
        map: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(key, invocation, EventPayload::Map(map))
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<ReproEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: ReproEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ReproEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events with a filter
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&ReproEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Event stream with filtering
pub struct EventStream {
    receiver: broadcast::Receiver<ReproEvent>,
    filter: Arc<dyn Fn(&ReproEvent) -> bool + Send + Sync>,
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<ReproEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const INVOCATION_STARTED: &str = "invocation.started";
    pub const INVOCATION_FAILED: &str = "invocation.failed";
    pub const INVOCATION_FINISHED: &str = "invocation.finished";

    pub const PUSH_STARTED: &str = "push.started";
    pub const PUSH_COMPLETED: &str = "push.completed";

    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_LISTING: &str = "run.listing";
    pub const RUN_STOPPED: &str = "run.stopped";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(ReproEvent::with_string(events::PUSH_COMPLETED, 1, "42"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::PUSH_COMPLETED);
        assert_eq!(event.invocation, 1);
        assert!(matches!(event.payload, EventPayload::String(ref s) if s == "42"));
    }

    #[tokio::test]
    async fn test_subscribe_filtered() {
        let emitter = EventEmitter::new(8);
        let mut stream = emitter.subscribe_filtered(|e| e.key.starts_with("run."));
        emitter.emit(ReproEvent::empty(events::PUSH_STARTED, 2));
        emitter.emit(ReproEvent::empty(events::RUN_STARTED, 2));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.key, events::RUN_STARTED);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::default();
        emitter.emit(ReproEvent::empty(events::INVOCATION_STARTED, 1));
    }

    #[test]
    fn test_map_payload_serializes_untagged() {
        let mut map = HashMap::new();
        map.insert("stale".to_string(), serde_json::Value::Bool(true));
        let event = ReproEvent::with_map(events::RUN_LISTING, 1, map);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["stale"], serde_json::Value::Bool(true));
    }
}
