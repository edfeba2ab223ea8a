//! Daemon assembly and lifecycle

use crate::config::{BerthConfig, EngineKind};
use crate::error::{DaemonError, DaemonResult};
use berth_events::EventBus;
use berth_health::{HealthMonitor, ProbeFactory};
use berth_proxy::{HttpProxyControl, ProxyControl, ProxySynchronizer, SyncDriver};
use berth_reconciler::{InMemorySpecStore, JsonFileSpecStore, Reconciler, SpecStore};
use berth_runtime::{DockerCliRuntime, GuardedRuntime, InMemoryRuntime, RuntimeClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Wired-up fleet: runtime, bus, health monitor, synchronizer and reconciler
pub struct Daemon {
    runtime: Arc<dyn RuntimeClient>,
    bus: EventBus,
    monitor: HealthMonitor,
    synchronizer: Option<Arc<ProxySynchronizer>>,
    reconciler: Arc<Reconciler>,
}

impl Daemon {
    /// Build every component from configuration. Nothing runs yet.
    pub async fn build(config: &BerthConfig) -> DaemonResult<Self> {
        let engine: Arc<dyn RuntimeClient> = match config.runtime.kind {
            EngineKind::Docker => Arc::new(DockerCliRuntime::new(&config.runtime.docker_binary)),
            EngineKind::Memory => Arc::new(InMemoryRuntime::new()),
        };
        let runtime: Arc<dyn RuntimeClient> =
            Arc::new(GuardedRuntime::new(engine, config.runtime_limits()));

        let bus = EventBus::new(config.bus_config());
        let health = config.health_config();
        let monitor = HealthMonitor::new(
            health.clone(),
            ProbeFactory::new(health.http_timeout, Some(runtime.clone())),
            bus.clone(),
        );

        let store: Arc<dyn SpecStore> = match &config.storage.path {
            Some(path) => Arc::new(JsonFileSpecStore::open(path).await?),
            None => {
                warn!("No storage path configured, applied specs will not survive a restart");
                Arc::new(InMemorySpecStore::new())
            }
        };

        let synchronizer = match &config.proxy.endpoint {
            Some(endpoint) => {
                let control: Arc<dyn ProxyControl> = Arc::new(HttpProxyControl::new(
                    endpoint.clone(),
                    Duration::from_secs(config.proxy.push_timeout_secs),
                )?);
                Some(Arc::new(ProxySynchronizer::new(control, config.sync_config())))
            }
            None => {
                warn!("No proxy endpoint configured, routing is disabled");
                None
            }
        };

        let mut reconciler = Reconciler::new(
            config.reconciler_config(),
            runtime.clone(),
            monitor.clone(),
            bus.clone(),
            store,
        );
        if let Some(synchronizer) = &synchronizer {
            reconciler = reconciler.with_proxy(synchronizer.clone());
        }

        info!(
            engine = runtime.name(),
            routing = synchronizer.is_some(),
            "Daemon assembled"
        );

        Ok(Self {
            runtime,
            bus,
            monitor,
            synchronizer,
            reconciler: Arc::new(reconciler),
        })
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    /// Resynchronize, run the background loops, and stop once `shutdown` resolves.
    ///
    /// Containers are left running on shutdown; the next start adopts them.
    pub async fn run<F>(self, shutdown: F) -> DaemonResult<()>
    where
        F: Future<Output = ()>,
    {
        let restored = self.reconciler.restore().await?;
        let report = self.reconciler.reconcile().await;
        info!(
            restored,
            running = report.running,
            adopted = report.adopted,
            orphans_removed = report.orphans_removed,
            errors = report.errors.len(),
            "Startup resync finished"
        );
        if let Some(error) = &report.runtime_error {
            warn!(engine = self.runtime.name(), error = %error, "Runtime unreachable at startup");
        }

        let (stop, stop_rx) = watch::channel(false);
        let reconciler_task = tokio::spawn(self.reconciler.clone().run(stop_rx.clone()));
        let driver_task = self.synchronizer.clone().map(|synchronizer| {
            let driver = SyncDriver::new(synchronizer, self.reconciler.clone(), self.bus.clone());
            tokio::spawn(driver.run(stop_rx.clone()))
        });

        shutdown.await;
        info!("Berth daemon shutting down");

        let _ = stop.send(true);
        reconciler_task
            .await
            .map_err(|e| DaemonError::Task(e.to_string()))?;
        if let Some(task) = driver_task {
            task.await.map_err(|e| DaemonError::Task(e.to_string()))?;
        }
        self.monitor.shutdown();

        let metrics = self.bus.metrics();
        info!(
            published = metrics.published,
            backpressure = metrics.backpressure,
            "Berth daemon stopped"
        );
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
