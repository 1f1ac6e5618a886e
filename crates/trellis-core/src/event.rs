use crate::config::EventsConfig;
use crate::status::Status;
use crate::types::NodeExecution;

/// Node lifecycle notifications.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A new attempt was saved.
    Started { node: NodeExecution },
    /// The status of a node changed.
    StatusUpdated {
        node: NodeExecution,
        previous: Status,
    },
    /// A non-status field changed (timeouts, retry flag, links).
    Updated { node: NodeExecution },
}

impl NodeEvent {
    pub fn node(&self) -> &NodeExecution {
        match self {
            NodeEvent::Started { node }
            | NodeEvent::StatusUpdated { node, .. }
            | NodeEvent::Updated { node } => node,
        }
    }
}

/// Fan-out of node lifecycle notifications over a tokio broadcast channel.
///
/// Every subscriber sees every event published after it subscribed. A
/// subscriber that falls more than `capacity` events behind gets
/// `RecvError::Lagged` and skips ahead; writers never block on readers.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Bus sized by the `[events]` section.
    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Send to current subscribers. Returns how many received it.
    pub fn publish(&self, event: NodeEvent) -> usize {
        // No subscribers is not an error for a writer
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::from_config(&EventsConfig::default())
    }
}
