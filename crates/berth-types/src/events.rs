//! Lifecycle and health events
//!
//! Events are carried on typed topics by the event bus. They describe what
//! happened; subscribers that need durability read authoritative state from
//! the reconciler instead.

use crate::health::HealthClassification;
use crate::ids::InstanceId;
use crate::instance::LifecycleState;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    InstanceStateChanged,
    HealthChanged,
    SpecApplied,
    SpecRemoved,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::InstanceStateChanged,
        Topic::HealthChanged,
        Topic::SpecApplied,
        Topic::SpecRemoved,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::InstanceStateChanged => "instance_state_changed",
            Topic::HealthChanged => "health_changed",
            Topic::SpecApplied => "spec_applied",
            Topic::SpecRemoved => "spec_removed",
        };
        write!(f, "{}", name)
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BerthEvent {
    /// An instance moved along its lifecycle
    InstanceStateChanged {
        service: String,
        instance_id: InstanceId,
        from: LifecycleState,
        to: LifecycleState,
        error: Option<String>,
    },

    /// Health classification flipped
    HealthChanged {
        service: String,
        instance_id: InstanceId,
        old: HealthClassification,
        new: HealthClassification,
    },

    /// A spec was registered or replaced
    SpecApplied {
        service: String,
        instance_id: InstanceId,
        generation: u64,
    },

    /// A spec was deleted
    SpecRemoved { service: String },
}

impl BerthEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BerthEvent::InstanceStateChanged { .. } => Topic::InstanceStateChanged,
            BerthEvent::HealthChanged { .. } => Topic::HealthChanged,
            BerthEvent::SpecApplied { .. } => Topic::SpecApplied,
            BerthEvent::SpecRemoved { .. } => Topic::SpecRemoved,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            BerthEvent::InstanceStateChanged { service, .. }
            | BerthEvent::HealthChanged { service, .. }
            | BerthEvent::SpecApplied { service, .. }
            | BerthEvent::SpecRemoved { service } => service,
        }
    }

    /// Whether the event can change the route table.
    pub fn affects_routing(&self) -> bool {
        match self {
            BerthEvent::InstanceStateChanged { from, to, .. } => {
                *from == LifecycleState::Running || *to == LifecycleState::Running
            }
            _ => true,
        }
    }
}

/// Component that published an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Reconciler,
    HealthMonitor,
    ProxySync,
}

/// Envelope wrapping every published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Publish time
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Publishing component
    pub source: EventSource,

    /// The event itself
    pub event: BerthEvent,
}

impl EventEnvelope {
    pub fn new(event: BerthEvent, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            event,
        }
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }
}
