//! Typed publish/subscribe channel for file system events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::view::ViewKey;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something that happened in the file system.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AfsEvent {
    /// An entry was written (absolute path)
    EntryWritten {
        /// Absolute path
        path: String,
    },
    /// An entry was deleted (absolute path)
    EntryDeleted {
        /// Absolute path
        path: String,
    },
    /// An entry was renamed (absolute paths)
    EntryRenamed {
        /// Old path
        from: String,
        /// New path
        to: String,
    },
    /// A source revision advanced
    SourceChanged {
        /// Module name
        module: String,
        /// Module-relative path
        path: String,
        /// New revision
        revision: String,
    },
    /// A projection finished generating
    ViewReady {
        /// Module name
        module: String,
        /// Module-relative path
        path: String,
        /// Canonical view key
        view: ViewKey,
    },
    /// A projection failed to generate
    ViewFailed {
        /// Module name
        module: String,
        /// Module-relative path
        path: String,
        /// Canonical view key
        view: ViewKey,
        /// Captured error message
        error: String,
    },
}

/// Broadcast bus shared by the composer and its modules.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AfsEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Events with no subscribers are dropped.
    pub fn publish(&self, event: AfsEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AfsEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(AfsEvent::EntryWritten {
            path: "/docs/a.md".to_string(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            AfsEvent::EntryWritten {
                path: "/docs/a.md".to_string()
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        bus.publish(AfsEvent::EntryDeleted {
            path: "/x".to_string(),
        });
    }
}
