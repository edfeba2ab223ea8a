//! Service instances and their lifecycle
//!
//! A ServiceInstance is the runtime-observed counterpart of one ServiceSpec.
//! Its lifecycle is a strict state machine: every change goes through
//! [`ServiceInstance::transition`], which rejects edges that are not allowed.

use crate::health::HealthClassification;
use crate::ids::{ContainerHandle, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Accepted, nothing created yet
    Pending,

    /// Container creation in progress
    Creating,

    /// Container created, start requested
    Starting,

    /// Runtime reports the container as up
    Running,

    /// Graceful stop in progress
    Stopping,

    /// Container stopped, not yet deleted
    Stopped,

    /// Container deleted (terminal)
    Removed,

    /// Container exited unexpectedly
    Crashed,

    /// Provisioning or restart gave up; awaits operator action
    Failed,
}

impl LifecycleState {
    /// Whether moving from `self` to `to` is a legal edge.
    pub fn can_transition_to(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Pending, Creating)
                | (Pending, Starting)
                | (Pending, Removed)
                | (Creating, Starting)
                | (Creating, Failed)
                | (Creating, Stopping)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Crashed, Starting)
                | (Crashed, Failed)
                | (Crashed, Stopping)
                | (Crashed, Removed)
                | (Failed, Creating)
                | (Failed, Starting)
                | (Failed, Stopping)
                | (Failed, Removed)
                | (Stopping, Stopped)
                | (Stopped, Removed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Removed)
    }

    /// States in which the instance is on its way out.
    pub fn is_tearing_down(&self) -> bool {
        matches!(
            self,
            LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Removed
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Creating => "creating",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Removed => "removed",
            LifecycleState::Crashed => "crashed",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Rejected lifecycle edge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for {instance}: {from} -> {to}")]
pub struct TransitionError {
    pub instance: InstanceId,
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Runtime-observed state bound to one ServiceSpec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier
    pub id: InstanceId,

    /// Owning service name
    pub service: String,

    /// Backing container, once created
    pub container: Option<ContainerHandle>,

    /// Network address reported by the runtime
    pub address: Option<String>,

    /// Lifecycle state
    pub state: LifecycleState,

    /// Last observed health classification
    pub health: HealthClassification,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last time the instance entered `running`
    pub started_at: Option<DateTime<Utc>>,

    /// Restarts performed under the restart policy
    pub restart_count: u32,

    /// Most recent error, if any
    pub last_error: Option<String>,

    /// Spec generation this instance was built from
    pub generation: u64,

    /// Fingerprint of the spec this instance was built from
    pub fingerprint: String,
}

impl ServiceInstance {
    pub fn new(service: impl Into<String>, generation: u64, fingerprint: impl Into<String>) -> Self {
        Self {
            id: InstanceId::generate(),
            service: service.into(),
            container: None,
            address: None,
            state: LifecycleState::Pending,
            health: HealthClassification::Unknown,
            created_at: Utc::now(),
            started_at: None,
            restart_count: 0,
            last_error: None,
            generation,
            fingerprint: fingerprint.into(),
        }
    }

    /// Advance the state machine, returning the previous state.
    pub fn transition(&mut self, to: LifecycleState) -> Result<LifecycleState, TransitionError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                instance: self.id.clone(),
                from,
                to,
            });
        }
        self.state = to;
        match to {
            LifecycleState::Running => {
                self.started_at = Some(Utc::now());
                self.last_error = None;
            }
            LifecycleState::Starting | LifecycleState::Creating => {
                self.health = HealthClassification::Unknown;
            }
            _ => {}
        }
        Ok(from)
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// Whether traffic may be routed here.
    pub fn is_routable(&self, health_gated: bool) -> bool {
        self.is_running() && (!health_gated || self.health == HealthClassification::Healthy)
    }
}
