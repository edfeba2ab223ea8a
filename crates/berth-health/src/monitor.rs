//! Health monitor
//!
//! Every registered instance gets its own probe task running on the interval
//! from its health check. Probes run under their own timeout and a shared
//! concurrency limit, so a hung probe only delays its own instance. Results
//! are folded into a [`HealthRecord`]; `HealthChanged` is published only when
//! the classification flips.

use crate::error::{HealthError, HealthResult};
use crate::probes::{Probe, ProbeFactory, ProbeResult, ProbeTarget};
use berth_events::EventBus;
use berth_types::{
    BerthEvent, EventSource, HealthCheckSpec, HealthClassification, HealthRecord, InstanceId,
    ServiceInstance, Thresholds,
};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Probes allowed in flight across all instances
    pub max_concurrent_probes: usize,

    /// Client-level timeout for HTTP probes
    pub http_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 64,
            http_timeout: Duration::from_secs(5),
        }
    }
}

struct Monitored {
    service: String,
    target: ProbeTarget,
    check: HealthCheckSpec,
    probe: Arc<dyn Probe>,
    record: HealthRecord,
}

struct MonitorInner {
    records: DashMap<InstanceId, Monitored>,
    tasks: DashMap<InstanceId, JoinHandle<()>>,
    factory: ProbeFactory,
    permits: Semaphore,
    bus: EventBus,
}

/// Per-instance health prober
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, factory: ProbeFactory, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                records: DashMap::new(),
                tasks: DashMap::new(),
                factory,
                permits: Semaphore::new(config.max_concurrent_probes.max(1)),
                bus,
            }),
        }
    }

    /// Start probing an instance with the probe its check declares.
    pub fn register(&self, instance: &ServiceInstance, check: HealthCheckSpec) -> HealthResult<()> {
        let probe = self.inner.factory.build(&check.probe)?;
        self.register_with_probe(instance, check, probe)
    }

    /// Start probing an instance with a caller-supplied probe.
    #[instrument(skip(self, instance, check, probe), fields(service = %instance.service, instance_id = %instance.id))]
    pub fn register_with_probe(
        &self,
        instance: &ServiceInstance,
        check: HealthCheckSpec,
        probe: Arc<dyn Probe>,
    ) -> HealthResult<()> {
        if self.inner.records.contains_key(&instance.id) {
            return Err(HealthError::AlreadyRegistered(instance.id.clone()));
        }

        info!(
            probe = probe.kind(),
            interval_ms = check.interval.as_millis() as u64,
            "Registering instance for health monitoring"
        );

        let interval = check.interval;
        self.inner.records.insert(
            instance.id.clone(),
            Monitored {
                service: instance.service.clone(),
                target: ProbeTarget::from_instance(instance),
                check,
                probe,
                record: HealthRecord::new(),
            },
        );

        let handle = tokio::spawn(probe_loop(
            Arc::downgrade(&self.inner),
            instance.id.clone(),
            interval,
        ));
        self.inner.tasks.insert(instance.id.clone(), handle);
        Ok(())
    }

    /// Stop probing an instance and drop its record.
    pub fn unregister(&self, instance_id: &InstanceId) -> HealthResult<()> {
        if let Some((_, handle)) = self.inner.tasks.remove(instance_id) {
            handle.abort();
        }
        match self.inner.records.remove(instance_id) {
            Some(_) => {
                debug!(instance_id = %instance_id, "Unregistered instance from health monitoring");
                Ok(())
            }
            None => Err(HealthError::NotRegistered(instance_id.clone())),
        }
    }

    /// Point future probes at the instance's current address and container.
    ///
    /// The health record and its hysteresis counters are kept.
    pub fn update_target(&self, instance: &ServiceInstance) -> HealthResult<()> {
        let mut entry = self
            .inner
            .records
            .get_mut(&instance.id)
            .ok_or_else(|| HealthError::NotRegistered(instance.id.clone()))?;
        entry.target = ProbeTarget::from_instance(instance);
        debug!(instance_id = %instance.id, address = ?instance.address, "Probe target updated");
        Ok(())
    }

    /// Where the next probe for an instance will point.
    pub fn target(&self, instance_id: &InstanceId) -> Option<ProbeTarget> {
        self.inner.records.get(instance_id).map(|m| m.target.clone())
    }

    pub fn is_registered(&self, instance_id: &InstanceId) -> bool {
        self.inner.records.contains_key(instance_id)
    }

    /// Current record for an instance.
    pub fn get(&self, instance_id: &InstanceId) -> Option<HealthRecord> {
        self.inner.records.get(instance_id).map(|m| m.record.clone())
    }

    pub fn classification(&self, instance_id: &InstanceId) -> HealthClassification {
        self.get(instance_id)
            .map(|r| r.classification)
            .unwrap_or_default()
    }

    pub fn registered_count(&self) -> usize {
        self.inner.records.len()
    }

    /// Run one probe now and fold its result in.
    pub async fn probe_once(&self, instance_id: &InstanceId) -> HealthResult<HealthRecord> {
        self.inner.probe_once(instance_id).await
    }

    /// Abort every probe task.
    pub fn shutdown(&self) {
        for entry in self.inner.tasks.iter() {
            entry.value().abort();
        }
        self.inner.tasks.clear();
        self.inner.records.clear();
    }
}

impl MonitorInner {
    async fn probe_once(&self, instance_id: &InstanceId) -> HealthResult<HealthRecord> {
        let (probe, target, timeout) = {
            let entry = self
                .records
                .get(instance_id)
                .ok_or_else(|| HealthError::NotRegistered(instance_id.clone()))?;
            (entry.probe.clone(), entry.target.clone(), entry.check.timeout)
        };

        // Waiting for a permit counts against the probe's own deadline.
        let attempt = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| HealthError::ProbeFailed("monitor shut down".into()))?;
            probe.execute(&target).await
        };
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ProbeResult::failure(e.to_string(), 0),
            Err(_) => ProbeResult::timeout(timeout),
        };

        let (record, change, service) = {
            let mut entry = self
                .records
                .get_mut(instance_id)
                .ok_or_else(|| HealthError::NotRegistered(instance_id.clone()))?;
            let thresholds = Thresholds::new(
                entry.check.failure_threshold,
                entry.check.success_threshold,
            );
            let change = entry.record.observe(result.success, thresholds);
            entry.record.last_message = result.message.clone();
            (entry.record.clone(), change, entry.service.clone())
        };

        if !result.success {
            debug!(
                service = %service,
                instance_id = %instance_id,
                failures = record.consecutive_failures,
                message = result.message.as_deref().unwrap_or(""),
                "Probe failed"
            );
        }

        if let Some((old, new)) = change {
            if new == HealthClassification::Unhealthy {
                warn!(service = %service, instance_id = %instance_id, %old, %new, "Health changed");
            } else {
                info!(service = %service, instance_id = %instance_id, %old, %new, "Health changed");
            }
            self.bus.publish(
                BerthEvent::HealthChanged {
                    service,
                    instance_id: instance_id.clone(),
                    old,
                    new,
                },
                EventSource::HealthMonitor,
            );
        }

        Ok(record)
    }
}

async fn probe_loop(inner: Weak<MonitorInner>, instance_id: InstanceId, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(HealthError::NotRegistered(_)) = inner.probe_once(&instance_id).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use berth_types::{LifecycleState, ProbeSpec, Topic};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Probe replaying a fixed script, then repeating the last result.
    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        last: Mutex<bool>,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: Mutex::new(true),
            })
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, _target: &ProbeTarget) -> HealthResult<ProbeResult> {
            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = next {
                *last = next;
            }
            if *last {
                Ok(ProbeResult::success(1))
            } else {
                Ok(ProbeResult::failure("scripted failure", 1))
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        fn kind(&self) -> &'static str {
            "hanging"
        }

        async fn execute(&self, _target: &ProbeTarget) -> HealthResult<ProbeResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProbeResult::success(0))
        }
    }

    /// Probe that passes once the target has an address.
    struct AddressProbe;

    #[async_trait]
    impl Probe for AddressProbe {
        fn kind(&self) -> &'static str {
            "address"
        }

        async fn execute(&self, target: &ProbeTarget) -> HealthResult<ProbeResult> {
            target.address()?;
            Ok(ProbeResult::success(0))
        }
    }

    fn running(service: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(service, 1, "fp");
        instance.state = LifecycleState::Running;
        instance.address = Some("127.0.0.1".into());
        instance
    }

    fn check(failure_threshold: u32) -> HealthCheckSpec {
        HealthCheckSpec::new(ProbeSpec::Tcp { port: 80 })
            .with_interval(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(1))
            .with_thresholds(failure_threshold, 1)
    }

    fn monitor() -> (HealthMonitor, EventBus) {
        let bus = EventBus::default();
        let monitor = HealthMonitor::new(
            HealthMonitorConfig::default(),
            ProbeFactory::default(),
            bus.clone(),
        );
        (monitor, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_flip_unhealthy() {
        let (monitor, bus) = monitor();
        let mut events = bus.subscribe(Topic::HealthChanged);
        let instance = running("web");
        monitor
            .register_with_probe(
                &instance,
                check(3),
                ScriptedProbe::new(&[true, false, false, false]),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(monitor.classification(&instance.id), HealthClassification::Unhealthy);
        let first = events.recv().await.unwrap();
        assert!(matches!(
            first.event,
            BerthEvent::HealthChanged {
                old: HealthClassification::Unknown,
                new: HealthClassification::Healthy,
                ..
            }
        ));
        let second = events.recv().await.unwrap();
        assert!(matches!(
            second.event,
            BerthEvent::HealthChanged {
                old: HealthClassification::Healthy,
                new: HealthClassification::Unhealthy,
                ..
            }
        ));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_below_threshold_stays_healthy() {
        let (monitor, bus) = monitor();
        let mut events = bus.subscribe(Topic::HealthChanged);
        let instance = running("web");
        let script = [true, false, false, true, false, true, false, false, true];
        monitor
            .register_with_probe(&instance, check(3), ScriptedProbe::new(&script))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5 * script.len() as u64 + 1)).await;
        let record = monitor.get(&instance.id).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(monitor.classification(&instance.id), HealthClassification::Healthy);
        // Only the initial unknown -> healthy flip.
        assert!(events.try_recv().is_some());
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out_without_blocking_others() {
        let (monitor, _bus) = monitor();
        let stuck = running("stuck");
        let fine = running("fine");
        monitor
            .register_with_probe(&stuck, check(1), Arc::new(HangingProbe))
            .unwrap();
        monitor
            .register_with_probe(&fine, check(1), ScriptedProbe::new(&[true]))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        let stuck_record = monitor.get(&stuck.id).unwrap();
        assert_eq!(stuck_record.classification, HealthClassification::Unhealthy);
        assert!(stuck_record.last_message.unwrap().contains("timed out"));
        assert_eq!(monitor.classification(&fine.id), HealthClassification::Healthy);
    }

    #[tokio::test]
    async fn test_register_twice_and_unregister() {
        let (monitor, _bus) = monitor();
        let instance = running("web");
        monitor
            .register_with_probe(&instance, check(3), ScriptedProbe::new(&[]))
            .unwrap();
        assert!(matches!(
            monitor.register_with_probe(&instance, check(3), ScriptedProbe::new(&[])),
            Err(HealthError::AlreadyRegistered(_))
        ));

        monitor.unregister(&instance.id).unwrap();
        assert!(!monitor.is_registered(&instance.id));
        assert!(matches!(
            monitor.unregister(&instance.id),
            Err(HealthError::NotRegistered(_))
        ));
        assert!(matches!(
            monitor.probe_once(&instance.id).await,
            Err(HealthError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_failure() {
        let (monitor, _bus) = monitor();
        let mut instance = running("web");
        instance.address = None;
        monitor.register(&instance, check(1)).unwrap();
        let record = monitor.probe_once(&instance.id).await.unwrap();
        assert_eq!(record.classification, HealthClassification::Unhealthy);
        assert!(record.last_message.unwrap().contains("no network address"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_wait_counts_against_probe_timeout() {
        let bus = EventBus::default();
        let monitor = HealthMonitor::new(
            HealthMonitorConfig {
                max_concurrent_probes: 1,
                ..HealthMonitorConfig::default()
            },
            ProbeFactory::default(),
            bus,
        );
        let stuck = running("stuck");
        let fine = running("fine");
        monitor
            .register_with_probe(
                &stuck,
                check(1).with_timeout(Duration::from_secs(10)),
                Arc::new(HangingProbe),
            )
            .unwrap();
        // Let the hanging probe take the only permit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor
            .register_with_probe(&fine, check(1), ScriptedProbe::new(&[true]))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let record = monitor.get(&fine.id).unwrap();
        assert_eq!(record.classification, HealthClassification::Unhealthy);
        assert!(record.last_message.unwrap().contains("timed out"));
        assert_eq!(monitor.classification(&stuck.id), HealthClassification::Unknown);
    }

    #[tokio::test]
    async fn test_update_target_keeps_record() {
        let (monitor, _bus) = monitor();
        let mut instance = running("web");
        instance.address = None;
        monitor
            .register_with_probe(&instance, check(3), Arc::new(AddressProbe))
            .unwrap();

        let record = monitor.probe_once(&instance.id).await.unwrap();
        assert!(record.consecutive_failures >= 1);
        assert!(record.last_message.unwrap().contains("no network address"));

        instance.address = Some("172.18.0.3".into());
        monitor.update_target(&instance).unwrap();
        assert_eq!(
            monitor.target(&instance.id).unwrap().address.as_deref(),
            Some("172.18.0.3")
        );
        let record = monitor.probe_once(&instance.id).await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.classification, HealthClassification::Healthy);

        let other = running("api");
        assert!(matches!(
            monitor.update_target(&other),
            Err(HealthError::NotRegistered(_))
        ));
    }
}
