//! Instance lifecycle driver
//!
//! Everything here runs with the service's slot lock held. A single
//! `converge` call advances the current instance as far as it can go without
//! waiting on a timer, finishes any pending teardown and attempts the
//! make-before-break cutover.

use crate::backoff::backoff_delay;
use crate::error::{ReconcileError, ReconcileResult};
use crate::reconciler::{Observation, Reconciler};
use crate::slot::{RetainedLogs, ServiceSlot};
use berth_runtime::{ContainerConfig, RuntimeError};
use berth_types::{
    BerthEvent, ContainerHandle, EventSource, HealthClassification, LifecycleState,
    ServiceInstance,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Advance the slot as far as possible.
    pub(crate) async fn converge(&self, slot: &mut ServiceSlot) -> ReconcileResult<()> {
        self.drain_retiring(slot).await;
        if slot.removing {
            self.publish_snapshot(slot);
            return Ok(());
        }
        let result = self.drive_current(slot).await;
        self.try_cutover(slot).await;
        self.publish_snapshot(slot);
        result
    }

    /// Fold a container listing into the slot. Returns whether a container was adopted.
    pub(crate) fn observe(
        &self,
        slot: &mut ServiceSlot,
        observation: &Observation,
    ) -> ReconcileResult<bool> {
        let mut adopted = false;
        let taken: HashSet<_> = slot
            .superseded
            .iter()
            .chain(slot.retiring.iter())
            .map(|i| i.id.clone())
            .collect();

        let mut exit = None;
        let mut retarget = false;
        if let Some(instance) = slot.current.as_mut() {
            match (instance.state, instance.container.clone()) {
                (LifecycleState::Pending, None) | (LifecycleState::Failed, None) => {
                    // A create that timed out may still have produced a container.
                    let found = observation.for_instance(&instance.id).or_else(|| {
                        if instance.state == LifecycleState::Pending {
                            observation.adoptable(&slot.spec.name, &slot.fingerprint, &taken)
                        } else {
                            None
                        }
                    });
                    if let Some(status) = found {
                        if let Some(id) = status.instance_id() {
                            instance.id = id;
                        }
                        instance.container = Some(status.handle.clone());
                        instance.address = status.address.clone();
                        self.handles
                            .insert(status.handle.clone(), slot.spec.name.clone());
                        info!(
                            service = %slot.spec.name,
                            instance_id = %instance.id,
                            handle = %status.handle,
                            up = status.state.is_up(),
                            "Adopted existing container"
                        );
                        adopted = true;
                    }
                }
                (LifecycleState::Running, Some(handle)) => match observation.get(&handle) {
                    None => exit = Some((None, true)),
                    Some(status) if !status.state.is_up() => exit = Some((status.exit_code, false)),
                    Some(status) => {
                        if instance.address.is_none() && status.address.is_some() {
                            instance.address = status.address.clone();
                            retarget = true;
                        }
                    }
                },
                (LifecycleState::Crashed, Some(handle)) => {
                    if observation.get(&handle).is_none() {
                        slot.container_lost = true;
                    }
                }
                _ => {}
            }
        }
        if retarget {
            if let Some(instance) = slot.current.as_ref() {
                // Probes registered before the address was known.
                if self.health.update_target(instance).is_ok() {
                    info!(service = %slot.spec.name, address = ?instance.address, "Health probes retargeted");
                }
            }
        }
        if let Some((exit_code, lost)) = exit {
            warn!(service = %slot.spec.name, ?exit_code, lost, "Running instance drifted");
            self.handle_exit(slot, exit_code, lost)?;
        }

        let superseded_gone = slot.superseded.as_ref().is_some_and(|old| {
            old.container
                .as_ref()
                .map_or(true, |h| !observation.get(h).is_some_and(|s| s.state.is_up()))
        });
        if superseded_gone {
            if let Some(old) = slot.superseded.take() {
                warn!(service = %slot.spec.name, instance_id = %old.id, "Superseded instance is no longer up");
                slot.retiring.push(old);
            }
        }

        self.publish_snapshot(slot);
        Ok(adopted)
    }

    async fn drive_current(&self, slot: &mut ServiceSlot) -> ReconcileResult<()> {
        let Some((state, has_container)) = slot
            .current
            .as_ref()
            .map(|i| (i.state, i.container.is_some()))
        else {
            return Ok(());
        };

        match state {
            LifecycleState::Pending if has_container => {
                self.advance(slot, LifecycleState::Starting)?;
                self.start_current(slot).await
            }
            LifecycleState::Pending => {
                self.advance(slot, LifecycleState::Creating)?;
                self.create_current(slot).await
            }
            LifecycleState::Failed => self.retry_failed(slot).await,
            LifecycleState::Crashed => self.restart_crashed(slot).await,
            LifecycleState::Running => {
                self.check_reset_window(slot);
                Ok(())
            }
            LifecycleState::Creating | LifecycleState::Starting => {
                // Left behind by an interrupted operation.
                self.mark_failed(slot, "operation interrupted".to_string(), true)
            }
            _ => Ok(()),
        }
    }

    async fn create_current(&self, slot: &mut ServiceSlot) -> ReconcileResult<()> {
        let Some(instance) = slot.current.as_ref() else {
            return Ok(());
        };
        let config = ContainerConfig::from_spec(&slot.spec, &instance.id, &slot.fingerprint);
        debug!(service = %slot.spec.name, container = %config.name, "Creating container");

        match self.runtime.create_container(&config).await {
            Ok(handle) => {
                self.attach(slot, handle);
                self.advance(slot, LifecycleState::Starting)?;
                self.start_current(slot).await
            }
            Err(e) => self.fail_current(slot, "create", e),
        }
    }

    async fn start_current(&self, slot: &mut ServiceSlot) -> ReconcileResult<()> {
        let Some(handle) = slot.current.as_ref().and_then(|i| i.container.clone()) else {
            return self.mark_failed(slot, "no container to start".to_string(), true);
        };

        if let Err(e) = self.runtime.start(&handle).await {
            if matches!(e, RuntimeError::NotFound(_)) {
                self.detach(slot);
            }
            return self.fail_current(slot, "start", e);
        }

        let status = match self.runtime.inspect(&handle).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(service = %slot.spec.name, error = %e, "Inspect after start failed, address pending");
                None
            }
        };
        if let Some(instance) = slot.current.as_mut() {
            instance.address = status.as_ref().and_then(|s| s.address.clone());
        }

        self.advance(slot, LifecycleState::Running)?;
        slot.retry = Default::default();
        self.start_health(slot);

        if let Some(status) = status.filter(|s| !s.state.is_up()) {
            self.handle_exit(slot, status.exit_code, false)?;
        }
        Ok(())
    }

    fn attach(&self, slot: &mut ServiceSlot, handle: ContainerHandle) {
        self.handles.insert(handle.clone(), slot.spec.name.clone());
        if let Some(instance) = slot.current.as_mut() {
            instance.container = Some(handle);
        }
    }

    fn detach(&self, slot: &mut ServiceSlot) {
        if let Some(handle) = slot.current.as_mut().and_then(|i| i.container.take()) {
            self.handles.remove(&handle);
        }
    }

    fn start_health(&self, slot: &mut ServiceSlot) {
        let Some(check) = slot.spec.health_check.clone() else {
            return;
        };
        let Some(instance) = slot.current.as_mut() else {
            return;
        };
        let _ = self.health.unregister(&instance.id);
        if let Err(e) = self.health.register(instance, check) {
            warn!(service = %instance.service, instance_id = %instance.id, error = %e, "Health check not started");
            instance.last_error = Some(format!("health check not started: {}", e));
        }
    }

    /// Record a failed runtime call against the current instance.
    fn fail_current(
        &self,
        slot: &mut ServiceSlot,
        operation: &str,
        error: RuntimeError,
    ) -> ReconcileResult<()> {
        let retryable = error.is_transient() || matches!(error, RuntimeError::NotFound(_));
        let reported = ReconcileError::from_runtime(operation, &error);
        let message = format!("{} failed: {}", operation, error);
        self.mark_failed(slot, message, retryable)?;
        Err(reported)
    }

    fn mark_failed(
        &self,
        slot: &mut ServiceSlot,
        message: String,
        retryable: bool,
    ) -> ReconcileResult<()> {
        slot.retry.attempts += 1;
        let attempts = slot.retry.attempts;
        let give_up = !retryable || self.config.retry.exhausted(attempts);

        let message = if retryable && give_up {
            format!("{}; giving up after {} attempts", message, attempts)
        } else {
            message
        };
        slot.retry.exhausted = give_up;
        slot.retry.not_before = None;
        if !give_up {
            let delay = self.config.retry.delay(attempts);
            slot.retry.not_before = Some(Instant::now() + delay);
            self.wake_after(slot.spec.name.clone(), delay);
        }

        if let Some(instance) = slot.current.as_mut() {
            instance.last_error = Some(message);
        }
        if slot.current.as_ref().is_some_and(|i| i.state == LifecycleState::Failed) {
            self.publish_snapshot(slot);
            return Ok(());
        }
        self.advance(slot, LifecycleState::Failed)
    }

    async fn retry_failed(&self, slot: &mut ServiceSlot) -> ReconcileResult<()> {
        if !slot.retry.due(Instant::now()) {
            return Ok(());
        }
        let has_container = slot
            .current
            .as_ref()
            .is_some_and(|i| i.container.is_some());
        info!(
            service = %slot.spec.name,
            attempt = slot.retry.attempts + 1,
            "Retrying provisioning"
        );
        if has_container {
            self.advance(slot, LifecycleState::Starting)?;
            return self.start_current(slot).await;
        }
        match self.find_created_container(slot).await {
            Ok(true) => {
                self.advance(slot, LifecycleState::Starting)?;
                self.start_current(slot).await
            }
            Ok(false) => {
                self.advance(slot, LifecycleState::Creating)?;
                self.create_current(slot).await
            }
            Err(e) => self.fail_current(slot, "list", e),
        }
    }

    /// Attach a container an earlier, seemingly failed, create left behind.
    async fn find_created_container(&self, slot: &mut ServiceSlot) -> Result<bool, RuntimeError> {
        let Some(instance_id) = slot.current.as_ref().map(|i| i.id.clone()) else {
            return Ok(false);
        };
        let observation = Observation::new(self.runtime.list_containers().await?);
        let Some(status) = observation.for_instance(&instance_id) else {
            return Ok(false);
        };
        info!(
            service = %slot.spec.name,
            instance_id = %instance_id,
            handle = %status.handle,
            "Found container from an earlier create"
        );
        let address = status.address.clone();
        self.attach(slot, status.handle.clone());
        if let Some(instance) = slot.current.as_mut() {
            instance.address = address;
        }
        Ok(true)
    }

    /// The current instance's container exited or vanished.
    pub(crate) fn handle_exit(
        &self,
        slot: &mut ServiceSlot,
        exit_code: Option<i64>,
        lost: bool,
    ) -> ReconcileResult<()> {
        let Some(instance) = slot.current.as_mut() else {
            return Ok(());
        };
        if instance.state != LifecycleState::Running {
            if lost && instance.state == LifecycleState::Crashed {
                slot.container_lost = true;
            }
            return Ok(());
        }

        let _ = self.health.unregister(&instance.id);
        instance.health = HealthClassification::Unknown;
        instance.last_error = Some(match (lost, exit_code) {
            (true, _) => "container disappeared".to_string(),
            (false, Some(code)) => format!("exited with code {}", code),
            (false, None) => "exited".to_string(),
        });
        slot.container_lost = lost;
        self.advance(slot, LifecycleState::Crashed)?;
        self.schedule_restart(slot, exit_code)
    }

    fn schedule_restart(&self, slot: &mut ServiceSlot, exit_code: Option<i64>) -> ReconcileResult<()> {
        slot.restart_at = None;
        let policy = slot.spec.restart_policy;
        if !policy.should_restart(exit_code) {
            info!(service = %slot.spec.name, %policy, ?exit_code, "Restart policy keeps instance crashed");
            return Ok(());
        }

        let budget = &self.config.restart;
        let now = Instant::now();
        let recent = slot.restarts.count_within(now, budget.window);
        if recent >= budget.max_restarts {
            if let Some(instance) = slot.current.as_mut() {
                instance.last_error = Some(format!(
                    "restart budget exhausted: {} restarts within {}s",
                    recent,
                    budget.window.as_secs()
                ));
            }
            slot.retry.exhausted = true;
            return self.advance(slot, LifecycleState::Failed);
        }

        let delay = backoff_delay(recent + 1, budget.base_delay, budget.max_delay);
        slot.restart_at = Some(now + delay);
        info!(
            service = %slot.spec.name,
            delay_ms = delay.as_millis() as u64,
            recent_restarts = recent,
            "Restart scheduled"
        );
        self.wake_after(slot.spec.name.clone(), delay);
        Ok(())
    }

    async fn restart_crashed(&self, slot: &mut ServiceSlot) -> ReconcileResult<()> {
        let Some(at) = slot.restart_at else {
            return Ok(());
        };
        let now = Instant::now();
        if now < at {
            return Ok(());
        }
        slot.restart_at = None;
        slot.restarts.record(now);

        let lost = slot.container_lost
            || slot.current.as_ref().is_some_and(|i| i.container.is_none());
        if !lost {
            if let Some(instance) = slot.current.as_mut() {
                instance.restart_count += 1;
                info!(service = %instance.service, restarts = instance.restart_count, "Restarting crashed instance");
            }
            self.advance(slot, LifecycleState::Starting)?;
            return self.start_current(slot).await;
        }

        // The container is gone; replace the instance rather than restart it.
        let Some(mut old) = slot.current.take() else {
            return Ok(());
        };
        if let Some(handle) = old.container.take() {
            self.handles.remove(&handle);
        }
        let mut fresh = ServiceInstance::new(&old.service, old.generation, &old.fingerprint);
        fresh.restart_count = old.restart_count + 1;
        info!(
            service = %old.service,
            previous = %old.id,
            replacement = %fresh.id,
            "Container lost, replacing instance"
        );
        self.record_transition(&mut old, LifecycleState::Removed)?;
        slot.current = Some(fresh);
        slot.container_lost = false;
        self.advance(slot, LifecycleState::Creating)?;
        self.create_current(slot).await
    }

    /// Clear the restart history once the instance has been stable long enough.
    fn check_reset_window(&self, slot: &mut ServiceSlot) {
        let Some(since) = slot.running_since else {
            return;
        };
        if slot.restarts.is_empty() || since.elapsed() < self.config.restart.reset_after {
            return;
        }
        let unhealthy = slot.current.as_ref().is_some_and(|i| {
            i.health == HealthClassification::Unhealthy
                || self.health.classification(&i.id) == HealthClassification::Unhealthy
        });
        if !unhealthy {
            debug!(service = %slot.spec.name, "Instance stable, restart history cleared");
            slot.restarts.clear();
        }
    }

    /// Retire the superseded instance once the current one carries the route.
    async fn try_cutover(&self, slot: &mut ServiceSlot) {
        let Some((old_id, old_running)) = slot
            .superseded
            .as_ref()
            .map(|old| (old.id.clone(), old.is_running()))
        else {
            return;
        };

        if old_running {
            let ready = slot
                .current
                .as_ref()
                .is_some_and(|i| self.is_serving(i, slot.spec.health_gated()));
            if !ready {
                return;
            }
            if let Some(proxy) = &self.proxy {
                self.publish_snapshot(slot);
                if let Err(e) = proxy.sync(self).await {
                    warn!(service = %slot.spec.name, error = %e, "Proxy has not taken the new route, keeping previous instance");
                    return;
                }
                let still_routed = proxy
                    .applied_table()
                    .await
                    .entries()
                    .any(|r| r.instance_id == old_id);
                if still_routed {
                    return;
                }
            }
        }

        if let Some(old) = slot.superseded.take() {
            info!(service = %slot.spec.name, instance_id = %old.id, "Retiring superseded instance");
            slot.retiring.push(old);
            self.drain_retiring(slot).await;
        }
    }

    /// Tear down every retiring instance; failures stay queued for the next pass.
    pub(crate) async fn drain_retiring(&self, slot: &mut ServiceSlot) {
        if slot.retiring.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut slot.retiring);
        for mut instance in pending {
            if let Err(e) = self.teardown(&mut instance, &mut slot.previous_logs).await {
                warn!(
                    service = %instance.service,
                    instance_id = %instance.id,
                    error = %e,
                    "Teardown incomplete, will retry"
                );
                instance.last_error = Some(e.to_string());
                slot.retiring.push(instance);
            }
        }
        self.publish_snapshot(slot);
    }

    async fn teardown(
        &self,
        instance: &mut ServiceInstance,
        retained: &mut Option<RetainedLogs>,
    ) -> ReconcileResult<()> {
        let _ = self.health.unregister(&instance.id);

        let Some(handle) = instance.container.clone() else {
            if !instance.state.can_transition_to(LifecycleState::Removed) {
                if instance.state.can_transition_to(LifecycleState::Stopping) {
                    self.record_transition(instance, LifecycleState::Stopping)?;
                }
                if instance.state == LifecycleState::Stopping {
                    self.record_transition(instance, LifecycleState::Stopped)?;
                }
            }
            if instance.state != LifecycleState::Removed {
                self.record_transition(instance, LifecycleState::Removed)?;
            }
            return Ok(());
        };

        if instance.state.can_transition_to(LifecycleState::Stopping) {
            self.record_transition(instance, LifecycleState::Stopping)?;
        }
        if matches!(instance.state, LifecycleState::Stopping | LifecycleState::Pending) {
            match self.runtime.stop(&handle, self.config.stop_grace).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(ReconcileError::from_runtime("stop", &e)),
            }
            if instance.state == LifecycleState::Stopping {
                self.record_transition(instance, LifecycleState::Stopped)?;
            }
        }

        if self.config.retained_log_lines > 0 {
            if let Ok(lines) = self
                .runtime
                .logs(&handle, self.config.retained_log_lines)
                .await
            {
                *retained = Some(RetainedLogs {
                    instance_id: instance.id.clone(),
                    lines,
                });
            }
        }

        match self.runtime.remove(&handle).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(ReconcileError::from_runtime("remove", &e)),
        }
        self.handles.remove(&handle);
        instance.container = None;
        if instance.state != LifecycleState::Removed {
            self.record_transition(instance, LifecycleState::Removed)?;
        }
        Ok(())
    }

    /// Move the current instance to `to` and republish the slot.
    pub(crate) fn advance(&self, slot: &mut ServiceSlot, to: LifecycleState) -> ReconcileResult<()> {
        let Some(instance) = slot.current.as_mut() else {
            return Ok(());
        };
        self.record_transition(instance, to)?;
        slot.running_since = (to == LifecycleState::Running).then(Instant::now);
        self.publish_snapshot(slot);
        Ok(())
    }

    /// Apply one lifecycle edge and publish it on the bus.
    pub(crate) fn record_transition(
        &self,
        instance: &mut ServiceInstance,
        to: LifecycleState,
    ) -> ReconcileResult<()> {
        let from = instance.transition(to)?;
        let error = if matches!(to, LifecycleState::Failed | LifecycleState::Crashed) {
            warn!(
                service = %instance.service,
                instance_id = %instance.id,
                %from,
                %to,
                error = instance.last_error.as_deref().unwrap_or(""),
                "Instance transition"
            );
            instance.last_error.clone()
        } else {
            info!(service = %instance.service, instance_id = %instance.id, %from, %to, "Instance transition");
            None
        };

        self.bus.publish(
            BerthEvent::InstanceStateChanged {
                service: instance.service.clone(),
                instance_id: instance.id.clone(),
                from,
                to,
                error,
            },
            EventSource::Reconciler,
        );
        Ok(())
    }

    /// Ask the control loop to revisit `service` after `delay`.
    pub(crate) fn wake_after(&self, service: String, delay: Duration) {
        let wakeups = self.wakeups.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakeups.send(service);
        });
    }
}
