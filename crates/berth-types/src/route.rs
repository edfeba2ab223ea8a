//! Derived routing state
//!
//! The route table is never declared. It is recomputed from the current
//! service views every time something relevant changes.

use crate::health::{HealthClassification, HealthRecord};
use crate::ids::InstanceId;
use crate::instance::ServiceInstance;
use crate::spec::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Route identity: host plus path prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub host: String,
    pub path: String,
}

impl RouteKey {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

/// One routing rule as pushed to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub host: String,
    pub path: String,

    /// `address:port` of the backing instance
    pub target: String,

    /// Service the route belongs to
    pub service: String,

    /// Instance currently receiving traffic
    pub instance_id: InstanceId,

    /// False while traffic is still held by a superseded instance during cutover
    pub active: bool,
}

impl RouteEntry {
    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.host.clone(), self.path.clone())
    }
}

/// Everything the synchronizer needs to know about one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceView {
    pub spec: ServiceSpec,

    /// Current instance, if one exists
    pub instance: Option<ServiceInstance>,

    /// Health record of the current instance
    pub health: Option<HealthRecord>,

    /// Previous instance kept alive until the replacement is routed
    pub superseded: Option<ServiceInstance>,
}

impl ServiceView {
    pub fn new(spec: ServiceSpec, instance: Option<ServiceInstance>) -> Self {
        Self {
            spec,
            instance,
            health: None,
            superseded: None,
        }
    }

    /// Whether the current instance is eligible for a route.
    pub fn current_routable(&self) -> bool {
        match &self.instance {
            Some(instance) => self.eligible(instance, self.health.as_ref()),
            None => false,
        }
    }

    fn eligible(&self, instance: &ServiceInstance, record: Option<&HealthRecord>) -> bool {
        if !instance.is_running() {
            return false;
        }
        if !self.spec.health_gated() {
            return true;
        }
        let classification = record
            .map(|r| r.classification)
            .unwrap_or(instance.health);
        classification == HealthClassification::Healthy
    }

    /// Instance that should receive traffic, preferring the current one.
    pub fn routed_instance(&self) -> Option<(&ServiceInstance, bool)> {
        if let Some(instance) = &self.instance {
            if self.eligible(instance, self.health.as_ref()) {
                return Some((instance, true));
            }
        }
        if let Some(old) = &self.superseded {
            if self.eligible(old, None) {
                return Some((old, false));
            }
        }
        None
    }
}

/// Full routing table keyed by host and path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    routes: BTreeMap<RouteKey, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the table from service views.
    ///
    /// When two services claim the same host and path, the service whose name
    /// sorts first keeps the route.
    pub fn compute<'a>(views: impl IntoIterator<Item = &'a ServiceView>) -> Self {
        let mut sorted: Vec<&ServiceView> = views.into_iter().collect();
        sorted.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));

        let mut table = Self::new();
        for view in sorted {
            let Some(rule) = &view.spec.route else {
                continue;
            };
            let Some((instance, active)) = view.routed_instance() else {
                continue;
            };
            let Some(address) = &instance.address else {
                continue;
            };
            let key = RouteKey::new(rule.host.clone(), rule.path.clone());
            if table.routes.contains_key(&key) {
                continue;
            }
            table.routes.insert(
                key,
                RouteEntry {
                    host: rule.host.clone(),
                    path: rule.path.clone(),
                    target: format!("{}:{}", address, rule.target_port),
                    service: view.spec.name.clone(),
                    instance_id: instance.id.clone(),
                    active,
                },
            );
        }
        table
    }

    pub fn insert(&mut self, entry: RouteEntry) {
        self.routes.insert(entry.key(), entry);
    }

    pub fn get(&self, key: &RouteKey) -> Option<&RouteEntry> {
        self.routes.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    /// Routes owned by a service.
    pub fn routes_for<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a RouteEntry> {
        self.routes.values().filter(move |r| r.service == service)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.routes_for(service).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Changes needed to go from `self` to `target`.
    pub fn diff(&self, target: &RouteTable) -> RouteDiff {
        let mut diff = RouteDiff::default();
        for (key, entry) in &target.routes {
            match self.routes.get(key) {
                None => diff.added.push(entry.clone()),
                Some(current) if current != entry => diff.changed.push(entry.clone()),
                Some(_) => {}
            }
        }
        for key in self.routes.keys() {
            if !target.routes.contains_key(key) {
                diff.removed.push(key.clone());
            }
        }
        diff
    }
}

/// Difference between two route tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDiff {
    pub added: Vec<RouteEntry>,
    pub removed: Vec<RouteKey>,
    pub changed: Vec<RouteEntry>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}
