//! End-to-end behaviour of apply, health gating, removal and cutover.

mod common;

use berth_proxy::{SyncDriver, SyncOutcome};
use berth_reconciler::{ReconcileError, SpecStore};
use berth_runtime::{Operation, RuntimeError};
use berth_types::{
    BerthEvent, HealthClassification, LifecycleState, PortMapping, RouteKey, Topic,
};
use common::{gated_web, settle, web, Harness};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn test_apply_reaches_running() {
    let h = Harness::new();
    let id = h.reconciler.apply(web()).await.unwrap();

    let instance = h.reconciler.get("web").unwrap();
    assert_eq!(instance.id, id);
    assert_eq!(instance.state, LifecycleState::Running);
    assert!(instance.address.is_some());
    assert!(instance.started_at.is_some());
    assert_eq!(h.runtime.running_for("web").await.len(), 1);
    assert!(h.store.get_spec("web").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_missing_image_fails_without_retry() {
    let h = Harness::new();
    h.runtime.missing_image("nginx:latest").await;

    h.reconciler.apply(web()).await.unwrap();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.reconciler.reconcile().await;
    }

    let instance = h.reconciler.get("web").unwrap();
    assert_eq!(instance.state, LifecycleState::Failed);
    assert!(instance
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("image not found")));
    assert_eq!(h.runtime.calls(Operation::Create).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_spec_is_rejected_before_persisting() {
    let h = Harness::new();
    let spec = web()
        .with_port(PortMapping::published(80, 8080))
        .with_port(PortMapping::published(81, 8080));

    assert!(matches!(
        h.reconciler.apply(spec).await,
        Err(ReconcileError::InvalidSpec(_))
    ));
    assert!(h.store.list_specs().await.unwrap().is_empty());
    assert!(matches!(
        h.reconciler.get("web"),
        Err(ReconcileError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_create_timeouts_are_retried_until_running() {
    let h = Harness::new();
    h.runtime
        .fail_times(
            Operation::Create,
            2,
            RuntimeError::Timeout {
                operation: "create",
                after: Duration::from_secs(30),
            },
        )
        .await;

    // The caller never sees the transient failure.
    h.reconciler.apply(web()).await.unwrap();
    let instance = h.reconciler.get("web").unwrap();
    assert_eq!(instance.state, LifecycleState::Failed);
    assert!(instance.last_error.is_some());

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.reconciler.reconcile().await;
    assert_eq!(
        h.reconciler.get("web").unwrap().state,
        LifecycleState::Failed
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    let report = h.reconciler.reconcile().await;
    assert!(report.errors.is_empty());
    let instance = h.reconciler.get("web").unwrap();
    assert_eq!(instance.state, LifecycleState::Running);
    assert!(instance.last_error.is_none());
    assert_eq!(h.runtime.calls(Operation::Create).await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_three_failed_probes_remove_the_route() {
    let h = Harness::new();
    h.reconciler.apply(gated_web()).await.unwrap();
    let id = h.reconciler.get("web").unwrap().id;

    // Not routed until the first probe passes.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.monitor.classification(&id), HealthClassification::Healthy);
    h.sync_now().await;
    assert!(h.proxy.table().await.has_service("web"));

    h.runtime.set_exec_exit_code(1).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    // Two failures are below the threshold.
    assert_eq!(h.monitor.classification(&id), HealthClassification::Healthy);
    assert_eq!(
        h.sync.sync(h.reconciler.as_ref()).await,
        Ok(SyncOutcome::Unchanged)
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.monitor.classification(&id), HealthClassification::Unhealthy);
    assert_eq!(h.reconciler.get("web").unwrap().health, HealthClassification::Unhealthy);
    h.sync_now().await;
    assert!(!h.proxy.table().await.has_service("web"));

    // Unhealthy instances keep running; health only gates routing.
    assert_eq!(h.reconciler.get("web").unwrap().state, LifecycleState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_remove_walks_teardown_states_and_drops_route() {
    let h = Harness::new();
    h.reconciler.apply(web()).await.unwrap();
    h.sync_now().await;
    assert!(h.proxy.table().await.has_service("web"));
    let id = h.reconciler.get("web").unwrap().id;

    let mut changes = h.bus.subscribe(Topic::InstanceStateChanged);
    h.reconciler.remove("web").await.unwrap();

    let mut seen = Vec::new();
    while let Some(envelope) = changes.try_recv() {
        if let BerthEvent::InstanceStateChanged {
            instance_id,
            from,
            to,
            ..
        } = envelope.event
        {
            assert_eq!(instance_id, id);
            seen.push((from, to));
        }
    }
    assert_eq!(
        seen,
        vec![
            (LifecycleState::Running, LifecycleState::Stopping),
            (LifecycleState::Stopping, LifecycleState::Stopped),
            (LifecycleState::Stopped, LifecycleState::Removed),
        ]
    );

    // Routes were withdrawn before the container stopped.
    assert!(!h.proxy.table().await.has_service("web"));
    assert!(matches!(
        h.reconciler.get("web"),
        Err(ReconcileError::NotFound(_))
    ));
    assert!(h.runtime.containers().await.is_empty());
    assert!(h.store.get_spec("web").await.unwrap().is_none());
    assert!(matches!(
        h.reconciler.remove("web").await,
        Err(ReconcileError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_replacing_ungated_service_never_drops_the_route() {
    let h = Harness::new();
    h.reconciler.apply(web()).await.unwrap();
    h.sync_now().await;
    let old = h.reconciler.get("web").unwrap();

    let new_id = h
        .reconciler
        .apply(web().with_env("RELEASE", "2"))
        .await
        .unwrap();
    assert_ne!(new_id, old.id);

    let key = RouteKey::new("web.local", "/");
    let history = h.proxy.history().await;
    assert!(history.len() >= 2);
    for document in &history {
        assert!(
            document.to_table().get(&key).is_some(),
            "route missing in version {}",
            document.version
        );
    }
    let table = h.proxy.table().await;
    assert_eq!(table.get(&key).unwrap().instance_id, new_id);

    // The old container is gone once the proxy confirmed the new route.
    let containers = h.runtime.containers().await;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].instance_id(), Some(new_id));
}

#[tokio::test(start_paused = true)]
async fn test_gated_replacement_waits_for_health() {
    let h = Harness::new();
    h.reconciler.apply(web()).await.unwrap();
    h.sync_now().await;
    let old = h.reconciler.get("web").unwrap();

    h.runtime.set_exec_exit_code(1).await;
    let new_id = h.reconciler.apply(gated_web()).await.unwrap();
    h.sync_now().await;

    // New instance runs but is not healthy: the old one keeps the route.
    let key = RouteKey::new("web.local", "/");
    assert_eq!(h.proxy.table().await.get(&key).unwrap().instance_id, old.id);
    assert_eq!(h.runtime.running_for("web").await.len(), 2);

    h.runtime.set_exec_exit_code(0).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.monitor.classification(&new_id), HealthClassification::Healthy);
    h.reconciler.reconcile().await;

    assert_eq!(h.proxy.table().await.get(&key).unwrap().instance_id, new_id);
    assert_eq!(h.runtime.running_for("web").await.len(), 1);
    for document in h.proxy.history().await {
        assert!(document.to_table().get(&key).is_some());
    }
    let retained = h.reconciler.previous_logs("web").unwrap().unwrap();
    assert_eq!(retained.instance_id, old.id);
    assert!(!retained.lines.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_is_idempotent_over_a_settled_fleet() {
    let h = Harness::new();
    h.reconciler.apply(web()).await.unwrap();
    h.sync_now().await;
    let pushes = h.sync.push_count();

    assert_eq!(
        h.sync.sync(h.reconciler.as_ref()).await,
        Ok(SyncOutcome::Unchanged)
    );
    assert_eq!(h.sync.push_count(), pushes);
}

#[tokio::test(start_paused = true)]
async fn test_fleet_with_sync_driver_tracks_health() {
    let h = Harness::new();
    let running = h.start();
    let driver = SyncDriver::new(h.sync.clone(), h.reconciler.clone(), h.bus.clone());
    let (driver_stop, driver_rx) = watch::channel(false);
    let driver_task = tokio::spawn(driver.run(driver_rx));
    settle().await;

    h.reconciler.apply(gated_web()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.proxy.table().await.has_service("web"));

    h.runtime.set_exec_exit_code(1).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!h.proxy.table().await.has_service("web"));
    assert_eq!(
        h.reconciler.get("web").unwrap().health,
        HealthClassification::Unhealthy
    );

    h.reconciler.remove("web").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.proxy.table().await.is_empty());
    assert!(h.reconciler.list().is_empty());

    driver_stop.send(true).unwrap();
    driver_task.await.unwrap();
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_apply_for_same_name_conflicts() {
    let h = Harness::new();
    h.runtime
        .set_latency(Operation::Create, Duration::from_secs(5))
        .await;

    let reconciler = h.reconciler.clone();
    let first = tokio::spawn(async move { reconciler.apply(web()).await });
    settle().await;

    assert!(matches!(
        h.reconciler.apply(web().with_env("A", "1")).await,
        Err(ReconcileError::ConflictingName(name)) if name == "web"
    ));

    let id = first.await.unwrap().unwrap();
    assert_eq!(h.reconciler.get("web").unwrap().id, id);
    // Once the first apply finished the name is free again.
    h.runtime.clear_latency(Operation::Create).await;
    assert!(h.reconciler.apply(web().with_env("A", "1")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_reapplying_identical_spec_keeps_instance() {
    let h = Harness::new();
    let id = h.reconciler.apply(web()).await.unwrap();
    assert_eq!(h.reconciler.apply(web()).await.unwrap(), id);
    assert_eq!(h.runtime.calls(Operation::Create).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_views_are_exposed_to_the_driver() {
    let h = Harness::new();
    h.reconciler.apply(web()).await.unwrap();
    let source: Arc<dyn berth_proxy::ViewSource> = h.reconciler.clone();
    let views = source.current_view().await;
    assert_eq!(views.len(), 1);
    assert!(views[0].current_routable());
}
