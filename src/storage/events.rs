//! Cache-invalidation events emitted after committed writes.
//!
//! Consumers (caches, dashboards) subscribe to the bus; publishing with no
//! subscribers is not an error, so writes never depend on listeners.

use crate::artifact::EntryType;
use crate::scope::Scope;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What kind of write happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationAction {
    Create,
    Update,
    Deactivate,
    Delete,
}

/// One committed write, published after the transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub entry_type: EntryType,
    pub entry_id: String,
    pub scope: Scope,
    pub action: InvalidationAction,
}

/// Broadcast bus for invalidation events.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Zero subscribers is fine.
    pub fn publish(&self, event: InvalidationEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeType;

    fn event(action: InvalidationAction) -> InvalidationEvent {
        InvalidationEvent {
            entry_type: EntryType::Guideline,
            entry_id: "g1".to_string(),
            scope: Scope::of(ScopeType::Project, "p1").unwrap(),
            action,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = InvalidationBus::default();
        // Must not panic or error
        bus.publish(event(InvalidationAction::Create));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = InvalidationBus::default();
        let mut rx = bus.subscribe();

        bus.publish(event(InvalidationAction::Update));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.action, InvalidationAction::Update);
        assert_eq!(received.entry_id, "g1");
    }
}
