//! Desired-state reconciler
//!
//! The reconciler owns every [`ServiceSpec`] and the instance built from it.
//! Public operations and the background loops all funnel through the same
//! per-name slot lock, so lifecycle transitions for one service are strictly
//! ordered while different services converge in parallel.

use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::slot::{RetainedLogs, ServiceSlot, SlotSnapshot};
use crate::store::SpecStore;
use async_trait::async_trait;
use berth_events::EventBus;
use berth_health::HealthMonitor;
use berth_proxy::{ProxySynchronizer, ViewSource};
use berth_runtime::{ContainerStatus, RuntimeClient, RuntimeError};
use berth_types::{
    BerthEvent, ContainerHandle, EventSource, HealthClassification, InstanceId, LifecycleState,
    ServiceInstance, ServiceSpec, ServiceView,
};
use dashmap::{DashMap, DashSet};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

pub(crate) type SlotCell = Arc<Mutex<Option<ServiceSlot>>>;

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Services visited
    pub services: usize,

    /// Services whose instance is running after the pass
    pub running: usize,

    /// Containers adopted from a previous run
    pub adopted: usize,

    /// Unreferenced managed containers removed
    pub orphans_removed: usize,

    /// Per-service convergence errors; none of them aborted the pass
    pub errors: Vec<ServiceError>,

    /// Listing containers failed, drift detection was skipped
    pub runtime_error: Option<String>,
}

/// A convergence error for one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceError {
    pub service: String,
    pub error: String,
}

pub(crate) struct SlotOutcome {
    pub service: String,
    pub state: Option<LifecycleState>,
    pub adopted: bool,
    pub error: Option<String>,
}

/// Containers seen by one pass, keyed by handle
pub(crate) struct Observation {
    containers: HashMap<ContainerHandle, ContainerStatus>,
}

impl Observation {
    pub fn new(containers: Vec<ContainerStatus>) -> Self {
        Self {
            containers: containers
                .into_iter()
                .map(|c| (c.handle.clone(), c))
                .collect(),
        }
    }

    pub fn get(&self, handle: &ContainerHandle) -> Option<&ContainerStatus> {
        self.containers.get(handle)
    }

    /// Container labelled with a specific instance.
    pub fn for_instance(&self, instance_id: &InstanceId) -> Option<&ContainerStatus> {
        self.containers
            .values()
            .find(|c| c.instance_id().as_ref() == Some(instance_id))
    }

    /// Container built from the same spec that nobody in `taken` owns.
    pub fn adoptable(
        &self,
        service: &str,
        fingerprint: &str,
        taken: &HashSet<InstanceId>,
    ) -> Option<&ContainerStatus> {
        let mut candidates: Vec<_> = self
            .containers
            .values()
            .filter(|c| c.service() == Some(service) && c.fingerprint() == Some(fingerprint))
            .filter(|c| c.instance_id().is_some_and(|id| !taken.contains(&id)))
            .collect();
        // Prefer a running container, then a stable order.
        candidates.sort_by_key(|c| (!c.state.is_up(), c.handle.as_str().to_string()));
        candidates.into_iter().next()
    }

    pub fn managed(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.containers.values().filter(|c| c.is_managed())
    }
}

/// Removes a name from the in-flight apply set when dropped
struct ApplyClaim<'a> {
    applying: &'a DashSet<String>,
    name: String,
}

impl<'a> ApplyClaim<'a> {
    fn acquire(applying: &'a DashSet<String>, name: &str) -> ReconcileResult<Self> {
        if !applying.insert(name.to_string()) {
            return Err(ReconcileError::ConflictingName(name.to_string()));
        }
        Ok(Self {
            applying,
            name: name.to_string(),
        })
    }
}

impl Drop for ApplyClaim<'_> {
    fn drop(&mut self) {
        self.applying.remove(&self.name);
    }
}

/// Converges actual containers towards the applied specs
pub struct Reconciler {
    pub(crate) config: ReconcilerConfig,
    pub(crate) runtime: Arc<dyn RuntimeClient>,
    pub(crate) health: HealthMonitor,
    pub(crate) bus: EventBus,
    pub(crate) store: Arc<dyn SpecStore>,
    pub(crate) proxy: Option<Arc<ProxySynchronizer>>,
    pub(crate) slots: DashMap<String, SlotCell>,
    pub(crate) snapshots: DashMap<String, SlotSnapshot>,
    pub(crate) handles: DashMap<ContainerHandle, String>,
    applying: DashSet<String>,
    generation: AtomicU64,
    pass: Mutex<()>,
    pub(crate) wakeups: mpsc::UnboundedSender<String>,
    pub(crate) wakeup_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        runtime: Arc<dyn RuntimeClient>,
        health: HealthMonitor,
        bus: EventBus,
        store: Arc<dyn SpecStore>,
    ) -> Self {
        let (wakeups, wakeup_rx) = mpsc::unbounded_channel();
        Self {
            config,
            runtime,
            health,
            bus,
            store,
            proxy: None,
            slots: DashMap::new(),
            snapshots: DashMap::new(),
            handles: DashMap::new(),
            applying: DashSet::new(),
            generation: AtomicU64::new(0),
            pass: Mutex::new(()),
            wakeups,
            wakeup_rx: Mutex::new(Some(wakeup_rx)),
        }
    }

    /// Confirm cutovers against this synchronizer before retiring old instances.
    pub fn with_proxy(mut self, proxy: Arc<ProxySynchronizer>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn publish_snapshot(&self, slot: &ServiceSlot) {
        self.snapshots
            .insert(slot.name().to_string(), slot.snapshot());
    }

    /// Drop a fully removed slot, unless it was replaced meanwhile.
    pub(crate) fn forget(&self, name: &str, cell: &SlotCell) {
        self.slots.remove_if(name, |_, v| Arc::ptr_eq(v, cell));
        self.snapshots.remove(name);
        debug!(service = %name, "Service forgotten");
    }

    /// Register or replace a spec.
    ///
    /// The spec is persisted before anything is acted on. A running previous
    /// instance keeps serving until the new one is routable. Transient
    /// runtime failures during the first convergence are not returned; the
    /// control loop retries them and `get` shows the instance's last error.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn apply(&self, spec: ServiceSpec) -> ReconcileResult<InstanceId> {
        spec.validate()?;
        let name = spec.name.clone();
        let _claim = ApplyClaim::acquire(&self.applying, &name)?;

        let cell = self
            .slots
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone();
        let mut guard = cell.lock().await;
        // A removal may have finished while we waited for the lock.
        if !self.slots.contains_key(&name) {
            self.slots.insert(name.clone(), cell.clone());
        }

        let fingerprint = spec.fingerprint();
        if let Some(existing) = guard.as_ref() {
            if let Some(current) = &existing.current {
                let healthy_path = !matches!(
                    current.state,
                    LifecycleState::Failed | LifecycleState::Crashed
                );
                if !existing.removing && existing.fingerprint == fingerprint && healthy_path {
                    debug!(instance_id = %current.id, "Spec unchanged, keeping current instance");
                    return Ok(current.id.clone());
                }
            }
        }

        if let Err(e) = self.store.upsert_spec(spec.clone()).await {
            if guard.is_none() {
                self.forget(&name, &cell);
            }
            return Err(e.into());
        }

        let generation = self.next_generation();
        let instance = ServiceInstance::new(&name, generation, &fingerprint);
        let instance_id = instance.id.clone();

        let slot = match guard.take() {
            Some(mut slot) => {
                self.supersede(&mut slot, spec, fingerprint, instance);
                slot
            }
            None => ServiceSlot::new(spec, fingerprint, instance),
        };
        let slot = guard.insert(slot);

        info!(generation, instance_id = %instance_id, "Spec applied");
        self.bus.publish(
            BerthEvent::SpecApplied {
                service: name.clone(),
                instance_id: instance_id.clone(),
                generation,
            },
            EventSource::Reconciler,
        );
        self.publish_snapshot(slot);

        if let Err(e) = self.converge(slot).await {
            warn!(error = %e, "Initial convergence incomplete");
        }
        Ok(instance_id)
    }

    fn supersede(
        &self,
        slot: &mut ServiceSlot,
        spec: ServiceSpec,
        fingerprint: String,
        instance: ServiceInstance,
    ) {
        let mut keep = None;
        if let Some(old) = slot.current.take() {
            if self.is_serving(&old, slot.spec.health_gated()) {
                keep = Some(old);
            } else {
                slot.retiring.push(old);
            }
        }
        if let Some(old) = slot.superseded.take() {
            let gated = self.health.is_registered(&old.id);
            if keep.is_none() && self.is_serving(&old, gated) {
                keep = Some(old);
            } else {
                slot.retiring.push(old);
            }
        }
        if let Some(old) = &keep {
            debug!(previous = %old.id, "Previous instance keeps serving until cutover");
        }

        slot.spec = spec;
        slot.fingerprint = fingerprint;
        slot.current = Some(instance);
        slot.superseded = keep;
        slot.retry = Default::default();
        slot.restarts.clear();
        slot.restart_at = None;
        slot.container_lost = false;
        slot.running_since = None;
        slot.removing = false;
    }

    /// Whether an instance is currently eligible for traffic.
    pub(crate) fn is_serving(&self, instance: &ServiceInstance, gated: bool) -> bool {
        instance.is_running()
            && (!gated || self.health.classification(&instance.id) == HealthClassification::Healthy)
    }

    /// Tear the service down and delete its spec.
    ///
    /// Routes are withdrawn before containers are stopped. Returns once
    /// teardown has been attempted; anything left is retried by `reconcile`
    /// and `get` keeps reporting the instance as `stopping` until then.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> ReconcileResult<()> {
        let cell = self
            .slots
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))?;
        let mut guard = cell.lock().await;
        // A service whose teardown is still pending has no spec left to remove.
        let Some(slot) = guard.as_mut().filter(|slot| !slot.removing) else {
            return Err(ReconcileError::NotFound(name.to_string()));
        };

        info!("Removing service");
        slot.removing = true;
        slot.restart_at = None;
        if let Some(old) = slot.superseded.take() {
            slot.retiring.insert(0, old);
        }
        if let Some(current) = slot.current.take() {
            slot.retiring.insert(0, current);
        }
        self.publish_snapshot(slot);
        self.bus.publish(
            BerthEvent::SpecRemoved {
                service: name.to_string(),
            },
            EventSource::Reconciler,
        );
        self.withdraw_routes().await;

        self.drain_retiring(slot).await;
        self.store.delete_spec(name).await?;

        if slot.is_drained() {
            *guard = None;
            self.forget(name, &cell);
            info!("Service removed");
        } else {
            self.publish_snapshot(slot);
            warn!(
                remaining = slot.retiring.len(),
                "Teardown incomplete, reconcile will retry"
            );
        }
        Ok(())
    }

    async fn withdraw_routes(&self) {
        let Some(proxy) = &self.proxy else {
            return;
        };
        if let Err(e) = proxy.sync(self).await {
            warn!(error = %e, "Could not withdraw routes before teardown");
        }
    }

    /// Instance currently reported for a service.
    pub fn get(&self, name: &str) -> ReconcileResult<ServiceInstance> {
        self.snapshots
            .get(name)
            .and_then(|s| s.visible().cloned())
            .map(|i| self.with_health(i))
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))
    }

    /// Snapshot of every reported instance, ordered by service name.
    pub fn list(&self) -> Vec<ServiceInstance> {
        let mut instances: Vec<_> = self
            .snapshots
            .iter()
            .filter_map(|s| s.visible().cloned())
            .map(|i| self.with_health(i))
            .collect();
        instances.sort_by(|a, b| a.service.cmp(&b.service));
        instances
    }

    /// Applied spec for a service.
    pub fn spec(&self, name: &str) -> ReconcileResult<ServiceSpec> {
        self.snapshots
            .get(name)
            .filter(|s| !s.removing)
            .map(|s| s.spec.clone())
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))
    }

    /// Last `tail` lines of the service's output.
    ///
    /// Falls back to the output retained from the previous instance when the
    /// current one has no container yet.
    pub async fn logs(&self, name: &str, tail: usize) -> ReconcileResult<Vec<String>> {
        let snapshot = self
            .snapshots
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))?;

        if let Some(handle) = snapshot.visible().and_then(|i| i.container.clone()) {
            return self
                .runtime
                .logs(&handle, tail)
                .await
                .map_err(|e| ReconcileError::from_runtime("logs", &e));
        }
        let lines = snapshot
            .previous_logs
            .map(|retained| {
                let skip = retained.lines.len().saturating_sub(tail);
                retained.lines[skip..].to_vec()
            })
            .unwrap_or_default();
        Ok(lines)
    }

    /// Output captured from the most recently retired instance.
    pub fn previous_logs(&self, name: &str) -> ReconcileResult<Option<RetainedLogs>> {
        self.snapshots
            .get(name)
            .map(|s| s.previous_logs.clone())
            .ok_or_else(|| ReconcileError::NotFound(name.to_string()))
    }

    fn with_health(&self, mut instance: ServiceInstance) -> ServiceInstance {
        if let Some(record) = self.health.get(&instance.id) {
            instance.health = record.classification;
        }
        instance
    }

    /// Current (spec, instance, health) view of every non-removed service.
    pub fn views(&self) -> Vec<ServiceView> {
        let mut views: Vec<ServiceView> = self
            .snapshots
            .iter()
            .filter(|s| !s.removing)
            .map(|s| self.view_of(s.value()))
            .collect();
        views.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        views
    }

    fn view_of(&self, snapshot: &SlotSnapshot) -> ServiceView {
        let instance = snapshot.current.clone().map(|i| self.with_health(i));
        let health = snapshot
            .current
            .as_ref()
            .and_then(|i| self.health.get(&i.id));
        // An unmonitored superseded instance was built from an ungated spec.
        let superseded = snapshot.superseded.clone().map(|mut old| {
            old.health = match self.health.get(&old.id) {
                Some(record) => record.classification,
                None if old.is_running() => HealthClassification::Healthy,
                None => HealthClassification::Unknown,
            };
            old
        });
        ServiceView {
            spec: snapshot.spec.clone(),
            instance,
            health,
            superseded,
        }
    }

    /// Load every stored spec into a pending slot without acting on it.
    ///
    /// Call [`Reconciler::reconcile`] afterwards; it adopts matching
    /// containers and creates the rest.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> ReconcileResult<usize> {
        let specs = self.store.list_specs().await?;
        let mut restored = 0;
        for spec in specs {
            if let Err(e) = spec.validate() {
                warn!(service = %spec.name, error = %e, "Skipping invalid stored spec");
                continue;
            }
            if self.slots.contains_key(&spec.name) {
                continue;
            }
            let fingerprint = spec.fingerprint();
            let instance = ServiceInstance::new(&spec.name, self.next_generation(), &fingerprint);
            let slot = ServiceSlot::new(spec, fingerprint, instance);
            self.publish_snapshot(&slot);
            self.slots
                .insert(slot.name().to_string(), Arc::new(Mutex::new(Some(slot))));
            restored += 1;
        }
        info!(restored, "Restored specs from store");
        Ok(restored)
    }

    /// Compare every slot against the runtime and repair drift.
    ///
    /// Services converge concurrently, bounded by the worker count; one
    /// service's failure never aborts the pass. Unreferenced managed
    /// containers are removed afterwards.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let _pass = self.pass.lock().await;
        let mut report = ReconcileReport::default();

        let observation = match self.runtime.list_containers().await {
            Ok(containers) => Some(Observation::new(containers)),
            Err(e) => {
                warn!(error = %e, "Could not list containers, skipping drift detection");
                report.runtime_error = Some(e.to_string());
                None
            }
        };

        let names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let outcomes: Vec<SlotOutcome> = stream::iter(names)
            .map(|name| self.reconcile_slot(name, observation.as_ref()))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.services += 1;
            if outcome.state == Some(LifecycleState::Running) {
                report.running += 1;
            }
            if outcome.adopted {
                report.adopted += 1;
            }
            if let Some(error) = outcome.error {
                report.errors.push(ServiceError {
                    service: outcome.service,
                    error,
                });
            }
        }

        if let Some(observation) = &observation {
            report.orphans_removed = self.remove_orphans(observation).await;
        }

        debug!(
            services = report.services,
            running = report.running,
            errors = report.errors.len(),
            orphans_removed = report.orphans_removed,
            "Reconcile pass finished"
        );
        report
    }

    /// Converge one service, optionally against a container listing.
    pub(crate) async fn reconcile_slot(
        &self,
        name: String,
        observation: Option<&Observation>,
    ) -> SlotOutcome {
        let mut outcome = SlotOutcome {
            service: name.clone(),
            state: None,
            adopted: false,
            error: None,
        };
        let Some(cell) = self.slots.get(&name).map(|e| e.value().clone()) else {
            return outcome;
        };
        let mut guard = cell.lock().await;
        let Some(slot) = guard.as_mut() else {
            return outcome;
        };

        if let Some(observation) = observation {
            match self.observe(slot, observation) {
                Ok(adopted) => outcome.adopted = adopted,
                Err(e) => outcome.error = Some(e.to_string()),
            }
        }
        if let Err(e) = self.converge(slot).await {
            outcome.error = Some(e.to_string());
        }
        outcome.state = slot.current.as_ref().map(|i| i.state);

        if slot.is_drained() {
            *guard = None;
            self.forget(&name, &cell);
            info!(service = %name, "Service removed");
        }
        outcome
    }

    async fn remove_orphans(&self, observation: &Observation) -> usize {
        let referenced: HashSet<InstanceId> = self
            .snapshots
            .iter()
            .flat_map(|s| s.instance_ids().cloned().collect::<Vec<_>>())
            .collect();

        let mut removed = 0;
        for status in observation.managed() {
            let owned = status
                .instance_id()
                .is_some_and(|id| referenced.contains(&id));
            if owned || self.handles.contains_key(&status.handle) {
                continue;
            }
            info!(
                handle = %status.handle,
                service = status.service().unwrap_or("-"),
                "Removing orphaned container"
            );
            if status.state.is_up() {
                match self.runtime.stop(&status.handle, self.config.stop_grace).await {
                    Ok(()) => {}
                    // Already torn down by its owner during this pass.
                    Err(RuntimeError::NotFound(_)) => continue,
                    Err(e) => {
                        warn!(handle = %status.handle, error = %e, "Failed to stop orphan");
                        continue;
                    }
                }
            }
            match self.runtime.remove(&status.handle).await {
                Ok(()) => removed += 1,
                Err(RuntimeError::NotFound(_)) => {}
                Err(e) => warn!(handle = %status.handle, error = %e, "Failed to remove orphan"),
            }
        }
        removed
    }
}

#[async_trait]
impl ViewSource for Reconciler {
    async fn current_view(&self) -> Vec<ServiceView> {
        self.views()
    }
}
