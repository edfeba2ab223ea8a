//! Proxy control endpoints
//!
//! The proxy accepts a complete route document and applies it atomically.
//! There is no partial-apply call.

use crate::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use berth_types::{RouteEntry, RouteTable};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Full routing document pushed to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDocument {
    /// Monotonic document version
    pub version: u64,

    pub generated_at: chrono::DateTime<chrono::Utc>,

    pub routes: Vec<RouteEntry>,
}

impl RouteDocument {
    pub fn from_table(version: u64, table: &RouteTable) -> Self {
        Self {
            version,
            generated_at: chrono::Utc::now(),
            routes: table.entries().cloned().collect(),
        }
    }

    pub fn to_table(&self) -> RouteTable {
        let mut table = RouteTable::new();
        for route in &self.routes {
            table.insert(route.clone());
        }
        table
    }
}

/// A proxy's control endpoint
#[async_trait]
pub trait ProxyControl: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the proxy's entire route set.
    async fn apply(&self, document: &RouteDocument) -> ProxyResult<()>;
}

/// Control endpoint reached with a single HTTP POST
pub struct HttpProxyControl {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProxyControl {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Unavailable(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ProxyControl for HttpProxyControl {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn apply(&self, document: &RouteDocument) -> ProxyResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(document)
            .send()
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(version = document.version, %status, "Proxy accepted routes");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body.trim());
        if status.is_client_error() {
            Err(ProxyError::Rejected(message))
        } else {
            Err(ProxyError::Unavailable(message))
        }
    }
}

#[derive(Default)]
struct MemoryProxyState {
    applied: Option<RouteDocument>,
    history: Vec<RouteDocument>,
    failures: VecDeque<ProxyError>,
    latency: Option<Duration>,
}

/// In-process proxy that records what it was given
#[derive(Default)]
pub struct MemoryProxy {
    state: RwLock<MemoryProxyState>,
}

impl MemoryProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next push with `error`.
    pub async fn fail_next(&self, error: ProxyError) {
        self.state.write().await.failures.push_back(error);
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    /// Currently applied table.
    pub async fn table(&self) -> RouteTable {
        self.state
            .read()
            .await
            .applied
            .as_ref()
            .map(RouteDocument::to_table)
            .unwrap_or_default()
    }

    /// Every accepted document, oldest first.
    pub async fn history(&self) -> Vec<RouteDocument> {
        self.state.read().await.history.clone()
    }

    /// Accepted pushes.
    pub async fn applied_count(&self) -> usize {
        self.state.read().await.history.len()
    }

    /// Drop the applied configuration, as if the proxy restarted empty.
    pub async fn wipe(&self) {
        self.state.write().await.applied = None;
    }
}

#[async_trait]
impl ProxyControl for MemoryProxy {
    fn name(&self) -> &str {
        "memory"
    }

    async fn apply(&self, document: &RouteDocument) -> ProxyResult<()> {
        let latency = self.state.read().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.write().await;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.applied = Some(document.clone());
        state.history.push(document.clone());
        Ok(())
    }
}
