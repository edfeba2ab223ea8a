//! Route table synchronization
//!
//! The synchronizer keeps the last table the proxy accepted. A sync computes
//! the target table from the current views, diffs it against that table and
//! pushes only when something changed. A failed push leaves the last-good
//! table in place and records the failure; the next trigger retries.

use crate::control::{ProxyControl, RouteDocument};
use crate::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use berth_types::{RouteDiff, RouteTable, ServiceView};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

/// Synchronizer configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Deadline for one push
    pub push_timeout: Duration,

    /// Safety-net interval for forced pushes
    pub resync_interval: Duration,

    /// Quiet period used to coalesce bursts of events
    pub debounce: Duration,

    /// Delay before retrying after a failed push
    pub retry_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_timeout: Duration::from_secs(5),
            resync_interval: Duration::from_secs(60),
            debounce: Duration::from_millis(100),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Supplies the current (spec, instance, health) views
#[async_trait]
pub trait ViewSource: Send + Sync {
    async fn current_view(&self) -> Vec<ServiceView>;
}

#[async_trait]
impl ViewSource for Vec<ServiceView> {
    async fn current_view(&self) -> Vec<ServiceView> {
        self.clone()
    }
}

/// What a sync did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Target equals the applied table; nothing was pushed
    Unchanged,

    /// A new table was pushed and accepted
    Applied(RouteDiff),
}

/// Reportable push failure
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub error: String,
    pub rejected: bool,
    pub at: chrono::DateTime<chrono::Utc>,

    /// Routes in the table that was not applied
    pub attempted_routes: usize,
}

/// Snapshot of synchronizer state
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub push_count: u64,
    pub applied_routes: usize,
    pub version: u64,
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<SyncFailure>,
}

#[derive(Default)]
struct SyncState {
    applied: RouteTable,
    version: u64,
    last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<SyncFailure>,
}

/// Pushes route tables derived from service views
pub struct ProxySynchronizer {
    control: Arc<dyn ProxyControl>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    push_count: AtomicU64,
}

impl ProxySynchronizer {
    pub fn new(control: Arc<dyn ProxyControl>, config: SyncConfig) -> Self {
        Self {
            control,
            config,
            state: Mutex::new(SyncState::default()),
            push_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Diff against the applied table and push if anything changed.
    ///
    /// Views are read while the applied table is locked, so concurrent
    /// callers push in the order they observed state.
    #[instrument(skip(self, source))]
    pub async fn sync<S>(&self, source: &S) -> ProxyResult<SyncOutcome>
    where
        S: ViewSource + ?Sized,
    {
        let mut state = self.state.lock().await;
        let views = source.current_view().await;
        let target = RouteTable::compute(views.iter());
        let diff = state.applied.diff(&target);
        if diff.is_empty() {
            debug!(services = views.len(), "Route table unchanged, skipping push");
            return Ok(SyncOutcome::Unchanged);
        }
        self.push(&mut state, target, diff).await
    }

    /// Push the target table even if it matches the applied one.
    ///
    /// Repairs configuration changed behind our back on the proxy.
    #[instrument(skip(self, source))]
    pub async fn resync<S>(&self, source: &S) -> ProxyResult<SyncOutcome>
    where
        S: ViewSource + ?Sized,
    {
        let mut state = self.state.lock().await;
        let views = source.current_view().await;
        let target = RouteTable::compute(views.iter());
        let diff = state.applied.diff(&target);
        self.push(&mut state, target, diff).await
    }

    async fn push(
        &self,
        state: &mut SyncState,
        target: RouteTable,
        diff: RouteDiff,
    ) -> ProxyResult<SyncOutcome> {
        let version = state.version + 1;
        let document = RouteDocument::from_table(version, &target);
        self.push_count.fetch_add(1, Ordering::Relaxed);

        let apply = self.control.apply(&document);
        let result = match tokio::time::timeout(self.config.push_timeout, apply).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Unavailable(format!(
                "push timed out after {:?}",
                self.config.push_timeout
            ))),
        };

        match result {
            Ok(()) => {
                info!(
                    proxy = self.control.name(),
                    version,
                    routes = target.len(),
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    "Applied route table"
                );
                state.applied = target;
                state.version = version;
                state.last_success_at = Some(chrono::Utc::now());
                state.last_error = None;
                Ok(SyncOutcome::Applied(diff))
            }
            Err(e) => {
                error!(
                    proxy = self.control.name(),
                    version,
                    error = %e,
                    kept_routes = state.applied.len(),
                    "Route push failed, keeping last applied table"
                );
                state.last_error = Some(SyncFailure {
                    error: e.to_string(),
                    rejected: matches!(e, ProxyError::Rejected(_)),
                    at: chrono::Utc::now(),
                    attempted_routes: target.len(),
                });
                Err(e)
            }
        }
    }

    /// Last table the proxy accepted.
    pub async fn applied_table(&self) -> RouteTable {
        self.state.lock().await.applied.clone()
    }

    /// Attempted pushes, successful or not.
    pub fn push_count(&self) -> u64 {
        self.push_count.load(Ordering::Relaxed)
    }

    pub async fn last_error(&self) -> Option<SyncFailure> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        SyncStatus {
            push_count: self.push_count(),
            applied_routes: state.applied.len(),
            version: state.version,
            last_success_at: state.last_success_at,
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryProxy;
    use berth_types::{
        HealthClassification, HealthCheckSpec, LifecycleState, PortMapping, ProbeSpec, RouteKey,
        RouteRule, ServiceInstance, ServiceSpec,
    };
    use tokio::sync::RwLock;

    fn view(name: &str, state: LifecycleState, health: HealthClassification) -> ServiceView {
        let spec = ServiceSpec::new(name, "nginx:latest")
            .with_port(PortMapping::tcp(80))
            .with_health_check(HealthCheckSpec::new(ProbeSpec::Tcp { port: 80 }))
            .with_route(RouteRule::new(format!("{name}.local"), "/", 80));
        let mut instance = ServiceInstance::new(name, 1, "fp");
        instance.state = state;
        instance.health = health;
        instance.address = Some("10.0.0.5".into());
        ServiceView::new(spec, Some(instance))
    }

    /// Reads shared views, then takes `delay` to hand them back.
    struct LiveViews {
        views: Arc<RwLock<Vec<ServiceView>>>,
        delay: Duration,
    }

    #[async_trait]
    impl ViewSource for LiveViews {
        async fn current_view(&self) -> Vec<ServiceView> {
            let views = self.views.read().await.clone();
            tokio::time::sleep(self.delay).await;
            views
        }
    }

    fn synchronizer() -> (Arc<MemoryProxy>, ProxySynchronizer) {
        let proxy = Arc::new(MemoryProxy::new());
        let sync = ProxySynchronizer::new(proxy.clone(), SyncConfig::default());
        (proxy, sync)
    }

    #[tokio::test]
    async fn test_second_sync_is_a_noop() {
        let (proxy, sync) = synchronizer();
        let views = vec![view("web", LifecycleState::Running, HealthClassification::Healthy)];

        assert!(matches!(sync.sync(&views).await, Ok(SyncOutcome::Applied(_))));
        assert_eq!(sync.sync(&views).await, Ok(SyncOutcome::Unchanged));
        assert_eq!(sync.push_count(), 1);
        assert_eq!(proxy.applied_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_initial_view_pushes_nothing() {
        let (proxy, sync) = synchronizer();
        assert_eq!(sync.sync(&Vec::new()).await, Ok(SyncOutcome::Unchanged));
        assert_eq!(proxy.applied_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejection_keeps_last_good_table() {
        let (proxy, sync) = synchronizer();
        let healthy = vec![view("web", LifecycleState::Running, HealthClassification::Healthy)];
        sync.sync(&healthy).await.unwrap();

        proxy
            .fail_next(ProxyError::Rejected("invalid upstream".into()))
            .await;
        let both = vec![
            view("web", LifecycleState::Running, HealthClassification::Healthy),
            view("api", LifecycleState::Running, HealthClassification::Healthy),
        ];
        assert!(matches!(
            sync.sync(&both).await,
            Err(ProxyError::Rejected(_))
        ));

        let applied = sync.applied_table().await;
        assert_eq!(applied.len(), 1);
        assert!(applied.has_service("web"));
        let failure = sync.last_error().await.unwrap();
        assert!(failure.rejected);
        assert_eq!(failure.attempted_routes, 2);
        assert_eq!(proxy.table().await, applied);

        // The next trigger retries and clears the failure.
        assert!(matches!(sync.sync(&both).await, Ok(SyncOutcome::Applied(_))));
        assert!(sync.last_error().await.is_none());
        assert_eq!(proxy.table().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_route_is_removed() {
        let (proxy, sync) = synchronizer();
        sync.sync(&vec![view("web", LifecycleState::Running, HealthClassification::Healthy)])
            .await
            .unwrap();
        let outcome = sync
            .sync(&vec![view("web", LifecycleState::Running, HealthClassification::Unhealthy)])
            .await
            .unwrap();
        match outcome {
            SyncOutcome::Applied(diff) => {
                assert_eq!(diff.removed, vec![RouteKey::new("web.local", "/")]);
            }
            other => panic!("expected a push, got {other:?}"),
        }
        assert!(proxy.table().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_timeout_is_unavailable() {
        let proxy = Arc::new(MemoryProxy::new());
        proxy.set_latency(Some(Duration::from_secs(30))).await;
        let sync = ProxySynchronizer::new(
            proxy.clone(),
            SyncConfig {
                push_timeout: Duration::from_secs(1),
                ..SyncConfig::default()
            },
        );
        let views = vec![view("web", LifecycleState::Running, HealthClassification::Healthy)];
        assert!(matches!(
            sync.sync(&views).await,
            Err(ProxyError::Unavailable(_))
        ));
        assert!(sync.applied_table().await.is_empty());
    }

    #[tokio::test]
    async fn test_resync_repairs_out_of_band_drift() {
        let (proxy, sync) = synchronizer();
        let views = vec![view("web", LifecycleState::Running, HealthClassification::Healthy)];
        sync.sync(&views).await.unwrap();
        proxy.wipe().await;

        assert_eq!(sync.sync(&views).await, Ok(SyncOutcome::Unchanged));
        assert!(proxy.table().await.is_empty());

        sync.resync(&views).await.unwrap();
        assert_eq!(proxy.table().await.len(), 1);
        assert_eq!(sync.status().await.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_syncs_finish_on_latest_view() {
        let (proxy, sync) = synchronizer();
        let sync = Arc::new(sync);
        let live = Arc::new(RwLock::new(vec![view(
            "web",
            LifecycleState::Running,
            HealthClassification::Healthy,
        )]));

        let slow = LiveViews {
            views: live.clone(),
            delay: Duration::from_millis(50),
        };
        let first = tokio::spawn({
            let sync = sync.clone();
            async move { sync.sync(&slow).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        *live.write().await = vec![view(
            "web",
            LifecycleState::Running,
            HealthClassification::Unhealthy,
        )];
        let fresh = LiveViews {
            views: live.clone(),
            delay: Duration::ZERO,
        };
        sync.sync(&fresh).await.unwrap();
        first.await.unwrap().unwrap();

        assert!(sync.applied_table().await.is_empty());
        assert!(proxy.table().await.is_empty());
        assert_eq!(proxy.applied_count().await, 2);
    }
}
