//! Timeout and concurrency guard around any engine
//!
//! Every call gets a deadline and a permit from a shared semaphore. A call
//! that misses its deadline is abandoned and reported as
//! [`RuntimeError::Timeout`]; the engine may still finish it in the
//! background, and the next reconcile pass repairs any drift.

use crate::client::{ContainerConfig, ContainerStatus, EventStream, ExecOutput, RuntimeClient};
use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use berth_types::ContainerHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Limits applied to engine calls
#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    /// Deadline for a single call
    pub call_timeout: Duration,

    /// Upper bound on in-flight calls
    pub max_concurrent_calls: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_concurrent_calls: 8,
        }
    }
}

/// Engine wrapper enforcing [`RuntimeLimits`]
pub struct GuardedRuntime {
    inner: Arc<dyn RuntimeClient>,
    limits: RuntimeLimits,
    permits: Arc<Semaphore>,
}

impl GuardedRuntime {
    pub fn new(inner: Arc<dyn RuntimeClient>, limits: RuntimeLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent_calls.max(1)));
        Self {
            inner,
            limits,
            permits,
        }
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        call: F,
    ) -> RuntimeResult<T>
    where
        F: Future<Output = RuntimeResult<T>> + Send,
    {
        let work = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| RuntimeError::Unavailable("runtime guard closed".into()))?;
            call.await
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    engine = self.inner.name(),
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Runtime call timed out"
                );
                Err(RuntimeError::Timeout {
                    operation,
                    after: timeout,
                })
            }
        }
    }
}

#[async_trait]
impl RuntimeClient for GuardedRuntime {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerStatus>> {
        self.guarded("list", self.limits.call_timeout, self.inner.list_containers())
            .await
    }

    async fn create_container(&self, config: &ContainerConfig) -> RuntimeResult<ContainerHandle> {
        self.guarded(
            "create",
            self.limits.call_timeout,
            self.inner.create_container(config),
        )
        .await
    }

    async fn start(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.guarded("start", self.limits.call_timeout, self.inner.start(handle))
            .await
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> RuntimeResult<()> {
        // The engine itself waits up to `grace` before killing.
        self.guarded(
            "stop",
            self.limits.call_timeout + grace,
            self.inner.stop(handle, grace),
        )
        .await
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.guarded("remove", self.limits.call_timeout, self.inner.remove(handle))
            .await
    }

    async fn inspect(&self, handle: &ContainerHandle) -> RuntimeResult<ContainerStatus> {
        self.guarded("inspect", self.limits.call_timeout, self.inner.inspect(handle))
            .await
    }

    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> RuntimeResult<Vec<String>> {
        self.guarded("logs", self.limits.call_timeout, self.inner.logs(handle, tail))
            .await
    }

    async fn exec(&self, handle: &ContainerHandle, command: &[String]) -> RuntimeResult<ExecOutput> {
        self.guarded("exec", self.limits.call_timeout, self.inner.exec(handle, command))
            .await
    }

    async fn stream_events(&self) -> RuntimeResult<EventStream> {
        // Only the subscription is guarded; the stream itself is long-lived.
        self.guarded("events", self.limits.call_timeout, self.inner.stream_events())
            .await
    }
}
