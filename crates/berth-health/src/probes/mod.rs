//! Probe strategies
//!
//! A probe is chosen per health check from its [`ProbeSpec`]. Strategies are
//! independent implementations of [`Probe`]; the monitor never inspects which
//! one it is running.

mod exec;
mod http;
mod tcp;

pub use exec::ExecProbe;
pub use http::HttpProbe;
pub use tcp::TcpProbe;

use crate::error::{HealthError, HealthResult};
use async_trait::async_trait;
use berth_runtime::RuntimeClient;
use berth_types::{ContainerHandle, InstanceId, ProbeSpec, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a probe points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub instance_id: InstanceId,
    pub address: Option<String>,
    pub container: Option<ContainerHandle>,
}

impl ProbeTarget {
    pub fn from_instance(instance: &ServiceInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            address: instance.address.clone(),
            container: instance.container.clone(),
        }
    }

    pub(crate) fn address(&self) -> HealthResult<&str> {
        self.address
            .as_deref()
            .ok_or_else(|| HealthError::NoAddress(self.instance_id.clone()))
    }

    pub(crate) fn container(&self) -> HealthResult<&ContainerHandle> {
        self.container
            .as_ref()
            .ok_or_else(|| HealthError::NoContainer(self.instance_id.clone()))
    }
}

/// Outcome of one probe execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,

    /// Probe latency in milliseconds
    pub latency_ms: u64,

    pub message: Option<String>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ProbeResult {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn failure(message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: false,
            latency_ms,
            message: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        let timeout_ms = timeout.as_millis() as u64;
        Self {
            success: false,
            latency_ms: timeout_ms,
            message: Some(format!("Probe timed out after {}ms", timeout_ms)),
            timestamp: chrono::Utc::now(),
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// A health probe strategy
#[async_trait]
pub trait Probe: Send + Sync {
    /// Strategy name for logging.
    fn kind(&self) -> &'static str;

    /// Probe the target once. Errors count as failures.
    async fn execute(&self, target: &ProbeTarget) -> HealthResult<ProbeResult>;
}

/// Builds probes from their declarations
#[derive(Clone)]
pub struct ProbeFactory {
    http: reqwest::Client,
    runtime: Option<Arc<dyn RuntimeClient>>,
}

impl ProbeFactory {
    pub fn new(http_timeout: Duration, runtime: Option<Arc<dyn RuntimeClient>>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_default();
        Self { http, runtime }
    }

    pub fn build(&self, spec: &ProbeSpec) -> HealthResult<Arc<dyn Probe>> {
        match spec {
            ProbeSpec::Tcp { port } => Ok(Arc::new(TcpProbe::new(*port))),
            ProbeSpec::Http { port, path, status } => Ok(Arc::new(HttpProbe::new(
                self.http.clone(),
                *port,
                path.clone(),
                *status,
            ))),
            ProbeSpec::Exec { command } => {
                let runtime = self.runtime.clone().ok_or(HealthError::NoRuntime)?;
                Ok(Arc::new(ExecProbe::new(runtime, command.clone())))
            }
        }
    }
}

impl Default for ProbeFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), None)
    }
}
