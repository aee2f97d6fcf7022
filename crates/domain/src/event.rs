//! Event — an immutable record of something that happened.
//!
//! Events are produced when devices appear or change state, when peers
//! announce themselves on the bus and when automations run. They flow
//! through the in-process event feed.

use serde::Serialize;

use crate::device::StateChange;
use crate::handshake::Handshake;
use crate::id::{EventId, ExecutionId};
use crate::scene::Scene;
use crate::time::{Timestamp, now};

/// What happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A device was registered.
    DeviceAdded { uid: String, entity_id: String },
    /// A device's state snapshot was replaced.
    DeviceUpdated {
        uid: String,
        entity_id: String,
        change: StateChange,
    },
    /// A peer signalled liveness.
    DiscoveryAlive { uid: String, at: Timestamp },
    /// A peer went away. `cascade` marks deaths derived from a parent's.
    DiscoveryDeath {
        uid: String,
        at: Timestamp,
        cascade: bool,
    },
    /// A peer handshake was received.
    DiscoveryHandshake { handshake: Box<Handshake> },
    /// A raw bus message that was not a discovery message.
    BusMessage { topic: String, payload: String },
    /// An automation finished running its action sequence.
    AutomationExecuted {
        automation: String,
        execution: ExecutionId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A scene was activated.
    SceneActivated { scene: Box<Scene> },
}

impl EventKind {
    /// Short, stable name of the event type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceAdded { .. } => "device.added",
            Self::DeviceUpdated { .. } => "device.updated",
            Self::DiscoveryAlive { .. } => "discovery.alive",
            Self::DiscoveryDeath { .. } => "discovery.death",
            Self::DiscoveryHandshake { .. } => "discovery.handshake",
            Self::BusMessage { .. } => "bus.message",
            Self::AutomationExecuted { .. } => "automation.executed",
            Self::SceneActivated { .. } => "scene.activated",
        }
    }
}

/// A timestamped, identified [`EventKind`].
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Record `kind` as happening now.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: now(),
            kind,
        }
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::DeviceAdded { uid, .. }
            | EventKind::DeviceUpdated { uid, .. }
            | EventKind::DiscoveryAlive { uid, .. }
            | EventKind::DiscoveryDeath { uid, .. } => write!(f, "{}({uid})", self.kind.name()),
            EventKind::DiscoveryHandshake { handshake } => {
                write!(f, "{}({})", self.kind.name(), handshake.uid)
            }
            EventKind::BusMessage { topic, .. } => write!(f, "{}({topic})", self.kind.name()),
            EventKind::AutomationExecuted { automation, .. } => {
                write!(f, "{}({automation})", self.kind.name())
            }
            EventKind::SceneActivated { scene } => write!(f, "{}({})", self.kind.name(), scene.uid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_generate_distinct_ids() {
        let a = Event::new(EventKind::BusMessage {
            topic: "a".to_string(),
            payload: String::new(),
        });
        let b = Event::new(a.kind.clone());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn should_serialize_flat_with_type_tag() {
        let event = Event::new(EventKind::DiscoveryDeath {
            uid: "lamp".to_string(),
            at: now(),
            cascade: true,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "discovery_death");
        assert_eq!(json["uid"], "lamp");
        assert_eq!(json["cascade"], true);
        assert!(json.get("id").is_some());
    }

    #[test]
    fn should_display_event_name_and_subject() {
        let event = Event::new(EventKind::DeviceAdded {
            uid: "lamp".to_string(),
            entity_id: "light.lamp".to_string(),
        });
        assert_eq!(event.to_string(), "device.added(lamp)");
    }
}
