#![allow(dead_code)]

use berth_events::EventBus;
use berth_health::{HealthMonitor, HealthMonitorConfig, ProbeFactory};
use berth_proxy::{MemoryProxy, ProxySynchronizer, SyncConfig};
use berth_reconciler::{
    InMemorySpecStore, Reconciler, ReconcilerConfig, RestartBudget, RetryPolicy, SpecStore,
};
use berth_runtime::{InMemoryRuntime, RuntimeClient};
use berth_types::{
    HealthCheckSpec, PortMapping, ProbeSpec, RestartPolicy, RouteRule, ServiceSpec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        tick_interval: Duration::from_secs(1),
        workers: 4,
        stop_grace: Duration::from_secs(1),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 5,
        },
        restart: RestartBudget {
            max_restarts: 3,
            window: Duration::from_secs(60),
            reset_after: Duration::from_secs(30),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        ..ReconcilerConfig::default()
    }
}

/// Spec with a route and no health check.
pub fn web() -> ServiceSpec {
    ServiceSpec::new("web", "nginx:latest")
        .with_port(PortMapping::tcp(80))
        .with_restart_policy(RestartPolicy::Always)
        .with_route(RouteRule::new("web.local", "/", 80))
}

/// Spec whose route is gated on an exec health check.
pub fn gated_web() -> ServiceSpec {
    web().with_health_check(
        HealthCheckSpec::new(ProbeSpec::Exec {
            command: vec!["true".into()],
        })
        .with_interval(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(1))
        .with_thresholds(3, 1),
    )
}

pub struct Harness {
    pub runtime: Arc<InMemoryRuntime>,
    pub proxy: Arc<MemoryProxy>,
    pub sync: Arc<ProxySynchronizer>,
    pub bus: EventBus,
    pub monitor: HealthMonitor,
    pub store: Arc<dyn SpecStore>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(
            config(),
            Arc::new(InMemoryRuntime::new()),
            Arc::new(InMemorySpecStore::new()),
        )
    }

    pub fn build(
        config: ReconcilerConfig,
        runtime: Arc<InMemoryRuntime>,
        store: Arc<dyn SpecStore>,
    ) -> Self {
        let bus = EventBus::default();
        let client: Arc<dyn RuntimeClient> = runtime.clone();
        let monitor = HealthMonitor::new(
            HealthMonitorConfig::default(),
            ProbeFactory::new(Duration::from_secs(1), Some(client.clone())),
            bus.clone(),
        );
        let proxy = Arc::new(MemoryProxy::new());
        let sync = Arc::new(ProxySynchronizer::new(proxy.clone(), SyncConfig::default()));
        let reconciler = Arc::new(
            Reconciler::new(config, client, monitor.clone(), bus.clone(), store.clone())
                .with_proxy(sync.clone()),
        );
        Self {
            runtime,
            proxy,
            sync,
            bus,
            monitor,
            store,
            reconciler,
        }
    }

    /// Spawn the reconciler's control loops.
    pub fn start(&self) -> Running {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.reconciler.clone().run(rx));
        Running { shutdown, task }
    }

    /// Push the reconciler's current view to the proxy.
    pub async fn sync_now(&self) {
        self.sync.sync(self.reconciler.as_ref()).await.unwrap();
    }
}

pub struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap();
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
