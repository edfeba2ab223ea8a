//! Event-driven sync loop
//!
//! Listens on the bus for anything that can change routing, waits a short
//! quiet period so bursts collapse into one sync, then pulls the current view
//! and syncs. A periodic tick forces a push to repair drift on the proxy, and
//! a failed push is retried after `retry_interval` even without new events.

use crate::sync::{ProxySynchronizer, ViewSource};
use berth_events::EventBus;
use berth_types::Topic;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drives a [`ProxySynchronizer`] from bus events and timers
pub struct SyncDriver {
    synchronizer: Arc<ProxySynchronizer>,
    source: Arc<dyn ViewSource>,
    bus: EventBus,
}

impl SyncDriver {
    pub fn new(
        synchronizer: Arc<ProxySynchronizer>,
        source: Arc<dyn ViewSource>,
        bus: EventBus,
    ) -> Self {
        Self {
            synchronizer,
            source,
            bus,
        }
    }

    async fn sync_now(&self, forced: bool) -> bool {
        let result = if forced {
            self.synchronizer.resync(self.source.as_ref()).await
        } else {
            self.synchronizer.sync(self.source.as_ref()).await
        };
        match result {
            Ok(outcome) => {
                debug!(forced, ?outcome, "Sync finished");
                true
            }
            Err(e) => {
                warn!(forced, error = %e, "Sync failed, will retry");
                false
            }
        }
    }

    /// Run until `shutdown` flips to true or the bus goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.synchronizer.config().clone();
        let mut events = self.bus.subscribe_many(&Topic::ALL);

        let mut resync = tokio::time::interval_at(
            Instant::now() + config.resync_interval,
            config.resync_interval,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let retry = tokio::time::sleep(config.retry_interval);
        tokio::pin!(retry);
        let mut retry_pending = false;

        info!("Proxy sync loop started");

        // Startup push so the proxy reflects reloaded state.
        if !self.sync_now(true).await {
            retry.as_mut().reset(Instant::now() + config.retry_interval);
            retry_pending = true;
        }

        loop {
            let ok = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = events.next() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !event.event.affects_routing() {
                        continue;
                    }
                    tokio::time::sleep(config.debounce).await;
                    let mut coalesced = 1;
                    while let Some(Some(_)) = events.next().now_or_never() {
                        coalesced += 1;
                    }
                    debug!(coalesced, "Routing-relevant events received");
                    self.sync_now(false).await
                }
                _ = resync.tick() => self.sync_now(true).await,
                () = &mut retry, if retry_pending => self.sync_now(false).await,
            };

            retry_pending = !ok;
            if retry_pending {
                retry.as_mut().reset(Instant::now() + config.retry_interval);
            }
        }

        info!("Proxy sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryProxy;
    use crate::error::ProxyError;
    use crate::sync::SyncConfig;
    use async_trait::async_trait;
    use berth_types::{
        BerthEvent, EventSource, InstanceId, LifecycleState, PortMapping, RouteRule,
        ServiceInstance, ServiceSpec, ServiceView,
    };
    use std::time::Duration;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct StaticViews(RwLock<Vec<ServiceView>>);

    #[async_trait]
    impl ViewSource for StaticViews {
        async fn current_view(&self) -> Vec<ServiceView> {
            self.0.read().await.clone()
        }
    }

    fn running_view(name: &str) -> ServiceView {
        let spec = ServiceSpec::new(name, "nginx:latest")
            .with_port(PortMapping::tcp(80))
            .with_route(RouteRule::new(format!("{name}.local"), "/", 80));
        let mut instance = ServiceInstance::new(name, 1, "fp");
        instance.state = LifecycleState::Running;
        instance.address = Some("10.0.0.7".into());
        ServiceView::new(spec, Some(instance))
    }

    fn state_changed(name: &str) -> BerthEvent {
        BerthEvent::InstanceStateChanged {
            service: name.into(),
            instance_id: InstanceId::generate(),
            from: LifecycleState::Starting,
            to: LifecycleState::Running,
            error: None,
        }
    }

    struct Harness {
        proxy: Arc<MemoryProxy>,
        views: Arc<StaticViews>,
        bus: EventBus,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(config: SyncConfig) -> Harness {
        let proxy = Arc::new(MemoryProxy::new());
        let views = Arc::new(StaticViews::default());
        let bus = EventBus::default();
        let synchronizer = Arc::new(ProxySynchronizer::new(proxy.clone(), config));
        let driver = SyncDriver::new(synchronizer, views.clone(), bus.clone());
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(driver.run(rx));
        Harness {
            proxy,
            views,
            bus,
            shutdown,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_coalesces_into_one_push() {
        let h = start(SyncConfig::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Startup forced push of the empty table.
        assert_eq!(h.proxy.applied_count().await, 1);

        h.views.0.write().await.push(running_view("web"));
        for _ in 0..20 {
            h.bus.publish(state_changed("web"), EventSource::Reconciler);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.proxy.applied_count().await, 2);
        assert!(h.proxy.table().await.has_service("web"));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_push_is_retried_without_new_events() {
        let h = start(SyncConfig::default());
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.views.0.write().await.push(running_view("web"));
        h.proxy
            .fail_next(ProxyError::Unavailable("reloading".into()))
            .await;
        h.bus.publish(state_changed("web"), EventSource::Reconciler);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!h.proxy.table().await.has_service("web"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(h.proxy.table().await.has_service("web"));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_net_tick_repairs_drift() {
        let h = start(SyncConfig {
            resync_interval: Duration::from_secs(30),
            ..SyncConfig::default()
        });
        h.views.0.write().await.push(running_view("web"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.proxy.table().await.has_service("web"));

        h.proxy.wipe().await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.proxy.table().await.has_service("web"));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }
}
