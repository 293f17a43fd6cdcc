//! In-process pub/sub for notifying local sessions.

use parley_shared::constants::TOPIC_INSTANCES;
use parley_shared::types::{Direction, InstanceStatus};
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Something local sessions may want to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FederationEvent {
    InstanceUpdated {
        domain: String,
        status: InstanceStatus,
        direction: Direction,
    },
    InstanceRemoved {
        domain: String,
    },
    FederationToggled {
        enabled: bool,
    },
    FriendRequest {
        user_id: i64,
        from_user_id: i64,
    },
    FriendAccepted {
        user_id: i64,
        from_user_id: i64,
    },
    FriendRemoved {
        user_id: i64,
        from_user_id: i64,
    },
    DirectMessage {
        user_id: i64,
        channel_id: i64,
        author_id: i64,
    },
}

impl FederationEvent {
    /// Topic the event is published on: instance changes go to the shared
    /// federation topic, user-scoped events to `user:<id>`.
    pub fn topic(&self) -> String {
        match self {
            Self::InstanceUpdated { .. }
            | Self::InstanceRemoved { .. }
            | Self::FederationToggled { .. } => TOPIC_INSTANCES.to_string(),
            Self::FriendRequest { user_id, .. }
            | Self::FriendAccepted { user_id, .. }
            | Self::FriendRemoved { user_id, .. }
            | Self::DirectMessage { user_id, .. } => format!("user:{user_id}"),
        }
    }
}

/// A published event with its topic.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub event: FederationEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: FederationEvent) {
        let topic = event.topic();
        tracing::debug!(topic = %topic, ?event, "publishing event");
        // No subscribers is fine.
        let _ = self.tx.send(Envelope { topic, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}
