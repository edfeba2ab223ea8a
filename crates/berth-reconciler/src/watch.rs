//! Background loops
//!
//! - the periodic reconcile tick, which also serves delayed retries
//! - the runtime event watcher, which reacts to container exits immediately
//! - the health watcher, which mirrors classifications into instances

use crate::reconciler::Reconciler;
use berth_runtime::RuntimeEvent;
use berth_types::{BerthEvent, HealthClassification, InstanceId, Topic};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

async fn next_wakeup(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn stopping(shutdown: &watch::Receiver<bool>, changed: Result<(), watch::error::RecvError>) -> bool {
    changed.is_err() || *shutdown.borrow()
}

impl Reconciler {
    /// Run the control loops until `shutdown` flips to true.
    ///
    /// The first tick fires immediately, so a freshly restored reconciler
    /// resynchronizes before anything else happens.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let events = tokio::spawn(self.clone().watch_runtime(shutdown.clone()));
        let health = tokio::spawn(self.clone().watch_health(shutdown.clone()));

        let mut wakeups = self.wakeup_rx.lock().await.take();
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            workers = self.config.workers,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if stopping(&shutdown, changed) {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let report = self.reconcile().await;
                    if !report.errors.is_empty() {
                        warn!(errors = report.errors.len(), "Reconcile pass finished with errors");
                    }
                }
                Some(service) = next_wakeup(&mut wakeups) => {
                    debug!(service = %service, "Delayed retry due");
                    self.reconcile_slot(service, None).await;
                }
            }
        }

        let _ = events.await;
        let _ = health.await;
        info!("Reconciler stopped");
    }

    async fn watch_runtime(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let policy = self.config.event_reconnect.clone();
        let mut failures: u32 = 0;
        let mut subscribed_before = false;

        loop {
            match self.runtime.stream_events().await {
                Ok(mut events) => {
                    if subscribed_before {
                        info!("Runtime event stream reconnected, reconciling missed changes");
                        self.reconcile().await;
                    }
                    subscribed_before = true;

                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if stopping(&shutdown, changed) {
                                    return;
                                }
                            }
                            item = events.next() => match item {
                                Some(Ok(event)) => {
                                    failures = 0;
                                    self.handle_runtime_event(event).await;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Runtime event stream failed");
                                    break;
                                }
                                None => {
                                    warn!("Runtime event stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Could not subscribe to runtime events"),
            }

            failures = failures.saturating_add(1);
            let delay = policy.delay(failures);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to runtime events");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if stopping(&shutdown, changed) {
                        return;
                    }
                }
            }
        }
    }

    /// React to one engine event for a managed container.
    pub(crate) async fn handle_runtime_event(&self, event: RuntimeEvent) {
        let handle = event.handle().clone();
        let Some(service) = self.handles.get(&handle).map(|e| e.value().clone()) else {
            return;
        };
        let (exit_code, lost) = match event {
            RuntimeEvent::Started { .. } => return,
            RuntimeEvent::Died { exit_code, .. } => (exit_code, false),
            RuntimeEvent::Destroyed { .. } => (None, true),
        };

        let Some(cell) = self.slots.get(&service).map(|e| e.value().clone()) else {
            return;
        };
        let mut guard = cell.lock().await;
        let Some(slot) = guard.as_mut() else {
            return;
        };

        let is_current = slot
            .current
            .as_ref()
            .is_some_and(|i| i.container.as_ref() == Some(&handle));
        let is_superseded = slot
            .superseded
            .as_ref()
            .is_some_and(|i| i.container.as_ref() == Some(&handle));

        if is_current {
            debug!(service = %service, handle = %handle, ?exit_code, lost, "Container exit reported");
            if let Err(e) = self.handle_exit(slot, exit_code, lost) {
                warn!(service = %service, error = %e, "Could not record container exit");
            }
        } else if is_superseded {
            if let Some(old) = slot.superseded.take() {
                warn!(service = %service, instance_id = %old.id, "Superseded instance exited");
                slot.retiring.push(old);
            }
        } else {
            return;
        }

        if let Err(e) = self.converge(slot).await {
            debug!(service = %service, error = %e, "Convergence after runtime event incomplete");
        }
    }

    async fn watch_health(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.bus.subscribe(Topic::HealthChanged);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if stopping(&shutdown, changed) {
                        return;
                    }
                }
                envelope = changes.recv() => {
                    let Some(envelope) = envelope else {
                        return;
                    };
                    if let BerthEvent::HealthChanged { service, instance_id, new, .. } = envelope.event {
                        self.apply_health(&service, &instance_id, new).await;
                    }
                }
            }
        }
    }

    /// Mirror a health classification into the owning instance.
    pub(crate) async fn apply_health(
        &self,
        service: &str,
        instance_id: &InstanceId,
        classification: HealthClassification,
    ) {
        let Some(cell) = self.slots.get(service).map(|e| e.value().clone()) else {
            return;
        };
        let mut guard = cell.lock().await;
        let Some(slot) = guard.as_mut() else {
            return;
        };

        let mut cutover = false;
        if let Some(current) = slot.current.as_mut().filter(|i| &i.id == instance_id) {
            current.health = classification;
            cutover = classification == HealthClassification::Healthy && slot.superseded.is_some();
        } else if let Some(old) = slot.superseded.as_mut().filter(|i| &i.id == instance_id) {
            old.health = classification;
        } else {
            return;
        }

        if cutover {
            if let Err(e) = self.converge(slot).await {
                debug!(service = %service, error = %e, "Convergence after health change incomplete");
            }
        } else {
            self.publish_snapshot(slot);
        }
    }
}
