//! Desired-state persistence
//!
//! Specs are persisted before they are acted on so a restarted daemon can
//! rebuild the fleet from the store and the runtime's labels.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use berth_types::ServiceSpec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Storage for service specs, keyed by name
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Get a spec by name
    async fn get_spec(&self, name: &str) -> StoreResult<Option<ServiceSpec>>;

    /// List all specs, ordered by name
    async fn list_specs(&self) -> StoreResult<Vec<ServiceSpec>>;

    /// Create or replace a spec
    async fn upsert_spec(&self, spec: ServiceSpec) -> StoreResult<()>;

    /// Delete a spec, returning whether it existed
    async fn delete_spec(&self, name: &str) -> StoreResult<bool>;
}

/// In-memory spec store
#[derive(Clone, Default)]
pub struct InMemorySpecStore {
    specs: Arc<RwLock<BTreeMap<String, ServiceSpec>>>,
}

impl InMemorySpecStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpecStore for InMemorySpecStore {
    async fn get_spec(&self, name: &str) -> StoreResult<Option<ServiceSpec>> {
        Ok(self.specs.read().await.get(name).cloned())
    }

    async fn list_specs(&self) -> StoreResult<Vec<ServiceSpec>> {
        Ok(self.specs.read().await.values().cloned().collect())
    }

    async fn upsert_spec(&self, spec: ServiceSpec) -> StoreResult<()> {
        self.specs.write().await.insert(spec.name.clone(), spec);
        Ok(())
    }

    async fn delete_spec(&self, name: &str) -> StoreResult<bool> {
        Ok(self.specs.write().await.remove(name).is_some())
    }
}

/// Spec store backed by one JSON document on disk
///
/// Every write replaces the file through a temporary file and a rename, so a
/// crash mid-write leaves either the old or the new document.
pub struct JsonFileSpecStore {
    path: PathBuf,
    specs: Mutex<BTreeMap<String, ServiceSpec>>,
}

impl JsonFileSpecStore {
    /// Open the store, loading the file if it exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let specs = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<ServiceSpec> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|s| (s.name.clone(), s)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        debug!(path = %path.display(), specs = specs.len(), "Opened spec store");
        Ok(Self {
            path,
            specs: Mutex::new(specs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, specs: &BTreeMap<String, ServiceSpec>) -> StoreResult<()> {
        let list: Vec<&ServiceSpec> = specs.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SpecStore for JsonFileSpecStore {
    async fn get_spec(&self, name: &str) -> StoreResult<Option<ServiceSpec>> {
        Ok(self.specs.lock().await.get(name).cloned())
    }

    async fn list_specs(&self) -> StoreResult<Vec<ServiceSpec>> {
        Ok(self.specs.lock().await.values().cloned().collect())
    }

    async fn upsert_spec(&self, spec: ServiceSpec) -> StoreResult<()> {
        let mut specs = self.specs.lock().await;
        let mut next = specs.clone();
        next.insert(spec.name.clone(), spec);
        self.persist(&next).await?;
        *specs = next;
        Ok(())
    }

    async fn delete_spec(&self, name: &str) -> StoreResult<bool> {
        let mut specs = self.specs.lock().await;
        if !specs.contains_key(name) {
            return Ok(false);
        }
        let mut next = specs.clone();
        next.remove(name);
        self.persist(&next).await?;
        *specs = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_types::{PortMapping, RestartPolicy};

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec::new(name, "nginx:latest")
            .with_port(PortMapping::tcp(80))
            .with_restart_policy(RestartPolicy::Always)
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = InMemorySpecStore::new();
        store.upsert_spec(spec("web")).await.unwrap();
        store.upsert_spec(spec("api")).await.unwrap();

        let names: Vec<_> = store
            .list_specs()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["api", "web"]);
        assert!(store.get_spec("web").await.unwrap().is_some());

        assert!(store.delete_spec("web").await.unwrap());
        assert!(!store.delete_spec("web").await.unwrap());
        assert!(store.get_spec("web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("specs.json");

        let store = JsonFileSpecStore::open(&path).await.unwrap();
        store.upsert_spec(spec("web")).await.unwrap();
        store.upsert_spec(spec("api")).await.unwrap();
        store.delete_spec("api").await.unwrap();
        drop(store);

        let reopened = JsonFileSpecStore::open(&path).await.unwrap();
        let specs = reopened.list_specs().await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0], spec("web"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        assert!(matches!(
            JsonFileSpecStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
