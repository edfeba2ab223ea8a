//! Runtime client capability
//!
//! The reconciler and the exec probe talk to the container engine only
//! through [`RuntimeClient`]. Engines own container handles; callers treat
//! them as opaque.

use crate::error::RuntimeResult;
use async_trait::async_trait;
use berth_types::{
    ContainerHandle, InstanceId, PortMapping, ServiceSpec, VolumeMount, LABEL_FINGERPRINT,
    LABEL_INSTANCE, LABEL_SERVICE,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Everything an engine needs to create a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name, unique per engine
    pub name: String,

    /// Image reference
    pub image: String,

    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,

    /// Ownership labels
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// Build the container configuration for one instance of a spec.
    pub fn from_spec(spec: &ServiceSpec, instance_id: &InstanceId, fingerprint: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_SERVICE.to_string(), spec.name.clone());
        labels.insert(LABEL_INSTANCE.to_string(), instance_id.as_uuid().to_string());
        labels.insert(LABEL_FINGERPRINT.to_string(), fingerprint.to_string());

        Self {
            name: format!("berth-{}-{}", spec.name, instance_id.short()),
            image: spec.image.clone(),
            env: spec.env.clone(),
            ports: spec.ports.clone(),
            volumes: spec.volumes.clone(),
            labels,
        }
    }
}

/// Coarse container state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn parse(value: &str) -> Self {
        match value {
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" | "removing" => ContainerState::Dead,
            _ => ContainerState::Created,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }
}

/// Inspected container status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub handle: ContainerHandle,
    pub name: String,
    pub image: String,
    pub state: ContainerState,

    /// Exit code once the container has stopped
    pub exit_code: Option<i64>,

    /// Network address, when the engine assigned one
    pub address: Option<String>,

    pub labels: BTreeMap<String, String>,
}

impl ContainerStatus {
    /// Owning service, for containers this system created.
    pub fn service(&self) -> Option<&str> {
        self.labels.get(LABEL_SERVICE).map(String::as_str)
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.labels
            .get(LABEL_INSTANCE)
            .and_then(|raw| InstanceId::parse(raw))
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.labels.get(LABEL_FINGERPRINT).map(String::as_str)
    }

    pub fn is_managed(&self) -> bool {
        self.service().is_some()
    }
}

/// Event emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Started { handle: ContainerHandle },
    Died { handle: ContainerHandle, exit_code: Option<i64> },
    Destroyed { handle: ContainerHandle },
}

impl RuntimeEvent {
    pub fn handle(&self) -> &ContainerHandle {
        match self {
            RuntimeEvent::Started { handle }
            | RuntimeEvent::Died { handle, .. }
            | RuntimeEvent::Destroyed { handle } => handle,
        }
    }
}

/// Output of a command run inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Stream of runtime events; ends when the engine connection drops
pub type EventStream = BoxStream<'static, RuntimeResult<RuntimeEvent>>;

/// Capability interface over a container engine
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// All containers, running or not.
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerStatus>>;

    /// Create (but do not start) a container.
    async fn create_container(&self, config: &ContainerConfig) -> RuntimeResult<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> RuntimeResult<()>;

    /// Stop gracefully, killing after `grace`. Stopping a stopped container succeeds.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> RuntimeResult<()>;

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()>;

    async fn inspect(&self, handle: &ContainerHandle) -> RuntimeResult<ContainerStatus>;

    /// Last `tail` lines of container output.
    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> RuntimeResult<Vec<String>>;

    /// Run a command inside a running container.
    async fn exec(&self, handle: &ContainerHandle, command: &[String]) -> RuntimeResult<ExecOutput>;

    /// Subscribe to engine events.
    ///
    /// The stream is lazy and ends on disconnect; callers reconnect by calling
    /// this again.
    async fn stream_events(&self) -> RuntimeResult<EventStream>;
}
