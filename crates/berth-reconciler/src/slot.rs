//! Per-service state owned by the reconciler
//!
//! Each service name maps to one slot behind its own async mutex; holding the
//! lock is what makes a caller the single writer for that name. Readers never
//! take the lock: every mutation republishes a [`SlotSnapshot`].

use crate::backoff::RestartHistory;
use berth_types::{InstanceId, ServiceInstance, ServiceSpec};
use serde::Serialize;
use tokio::time::Instant;

/// Output captured from an instance before its container was removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetainedLogs {
    pub instance_id: InstanceId,
    pub lines: Vec<String>,
}

/// Provisioning retry bookkeeping for the current instance
#[derive(Debug, Clone, Default)]
pub(crate) struct RetryState {
    /// Failed attempts since the last success
    pub attempts: u32,

    /// Earliest time the next attempt may run
    pub not_before: Option<Instant>,

    /// No further automatic attempts
    pub exhausted: bool,
}

impl RetryState {
    pub fn due(&self, now: Instant) -> bool {
        !self.exhausted && self.not_before.map_or(true, |at| now >= at)
    }
}

pub(crate) struct ServiceSlot {
    pub spec: ServiceSpec,
    pub fingerprint: String,

    /// Live instance; `None` only while the service is being removed
    pub current: Option<ServiceInstance>,

    /// Previous instance still serving until the current one is routed
    pub superseded: Option<ServiceInstance>,

    /// Instances whose teardown has started but not finished
    pub retiring: Vec<ServiceInstance>,

    pub retry: RetryState,
    pub restarts: RestartHistory,

    /// When a crashed current instance may be restarted
    pub restart_at: Option<Instant>,

    /// The current instance's container no longer exists
    pub container_lost: bool,

    /// When the current instance last entered `running`
    pub running_since: Option<Instant>,

    pub removing: bool,
    pub previous_logs: Option<RetainedLogs>,
}

impl ServiceSlot {
    pub fn new(spec: ServiceSpec, fingerprint: String, instance: ServiceInstance) -> Self {
        Self {
            spec,
            fingerprint,
            current: Some(instance),
            superseded: None,
            retiring: Vec::new(),
            retry: RetryState::default(),
            restarts: RestartHistory::new(),
            restart_at: None,
            container_lost: false,
            running_since: None,
            removing: false,
            previous_logs: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Removal finished: nothing left to tear down.
    pub fn is_drained(&self) -> bool {
        self.removing
            && self.current.is_none()
            && self.superseded.is_none()
            && self.retiring.is_empty()
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            spec: self.spec.clone(),
            current: self.current.clone(),
            superseded: self.superseded.clone(),
            retiring: self.retiring.clone(),
            removing: self.removing,
            previous_logs: self.previous_logs.clone(),
        }
    }
}

/// Read-side copy of a slot
#[derive(Debug, Clone)]
pub(crate) struct SlotSnapshot {
    pub spec: ServiceSpec,
    pub current: Option<ServiceInstance>,
    pub superseded: Option<ServiceInstance>,
    pub retiring: Vec<ServiceInstance>,
    pub removing: bool,
    pub previous_logs: Option<RetainedLogs>,
}

impl SlotSnapshot {
    /// Instance reported to callers: the current one, else the one being torn down.
    pub fn visible(&self) -> Option<&ServiceInstance> {
        self.current.as_ref().or_else(|| self.retiring.first())
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &InstanceId> {
        self.current
            .iter()
            .chain(self.superseded.iter())
            .chain(self.retiring.iter())
            .map(|i| &i.id)
    }
}
