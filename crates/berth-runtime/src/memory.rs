//! In-memory container engine
//!
//! Behaves like a small, instant Docker: containers are created, started,
//! stopped and removed in a map. Faults can be injected per operation, which
//! is what the reconciler and health tests use to drive failure paths.

use crate::client::{
    ContainerConfig, ContainerState, ContainerStatus, EventStream, ExecOutput, RuntimeClient,
    RuntimeEvent,
};
use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use berth_types::ContainerHandle;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// Engine operations, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    Logs,
    Exec,
    Events,
}

struct MemContainer {
    status: ContainerStatus,
    seq: u64,
    logs: Vec<String>,
}

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, MemContainer>,
    failures: HashMap<Operation, VecDeque<RuntimeError>>,
    lost_replies: HashMap<Operation, VecDeque<RuntimeError>>,
    latency: HashMap<Operation, Duration>,
    missing_images: HashSet<String>,
    exec_exit_code: i64,
    calls: HashMap<Operation, usize>,
    next_seq: u64,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Map-backed engine with fault injection
pub struct InMemoryRuntime {
    state: RwLock<EngineState>,
    events: RwLock<broadcast::Sender<RuntimeEvent>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(EngineState::default()),
            events: RwLock::new(events),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    async fn enter(&self, op: Operation) -> RuntimeResult<InFlight<'_>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let (latency, failure) = {
            let mut state = self.state.write().await;
            *state.calls.entry(op).or_default() += 1;
            let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (state.latency.get(&op).copied(), failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => {
                debug!(?op, error = %err, "Injected runtime fault");
                Err(err)
            }
            None => Ok(guard),
        }
    }

    async fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.read().await.send(event);
    }

    /// Fail the next call of `op` with `error`.
    pub async fn fail_next(&self, op: Operation, error: RuntimeError) {
        self.fail_times(op, 1, error).await;
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub async fn fail_times(&self, op: Operation, times: usize, error: RuntimeError) {
        let mut state = self.state.write().await;
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Let the next call of `op` take effect but report `error` to the caller.
    ///
    /// Honoured by create and start.
    pub async fn lose_next_reply(&self, op: Operation, error: RuntimeError) {
        let mut state = self.state.write().await;
        state.lost_replies.entry(op).or_default().push_back(error);
    }

    fn lost_reply(state: &mut EngineState, op: Operation) -> Option<RuntimeError> {
        let error = state.lost_replies.get_mut(&op).and_then(VecDeque::pop_front)?;
        debug!(?op, error = %error, "Reply lost after the operation took effect");
        Some(error)
    }

    /// Delay every call of `op`.
    pub async fn set_latency(&self, op: Operation, latency: Duration) {
        self.state.write().await.latency.insert(op, latency);
    }

    pub async fn clear_latency(&self, op: Operation) {
        self.state.write().await.latency.remove(&op);
    }

    /// Make creation from `image` fail deterministically.
    pub async fn missing_image(&self, image: impl Into<String>) {
        self.state.write().await.missing_images.insert(image.into());
    }

    /// Exit code returned by every exec.
    pub async fn set_exec_exit_code(&self, code: i64) {
        self.state.write().await.exec_exit_code = code;
    }

    /// Kill a running container and report it on the event stream.
    pub async fn crash(&self, handle: &ContainerHandle, exit_code: i64) -> bool {
        if self.exit(handle, exit_code).await {
            self.emit(RuntimeEvent::Died {
                handle: handle.clone(),
                exit_code: Some(exit_code),
            })
            .await;
            true
        } else {
            false
        }
    }

    /// Kill a running container without emitting an event.
    pub async fn exit_silently(&self, handle: &ContainerHandle, exit_code: i64) -> bool {
        self.exit(handle, exit_code).await
    }

    async fn exit(&self, handle: &ContainerHandle, exit_code: i64) -> bool {
        let mut state = self.state.write().await;
        match state.containers.get_mut(handle.as_str()) {
            Some(container) if container.status.state.is_up() => {
                container.status.state = ContainerState::Exited;
                container.status.exit_code = Some(exit_code);
                container.logs.push(format!("exited with code {}", exit_code));
                true
            }
            _ => false,
        }
    }

    /// End every open event stream.
    pub async fn disconnect_events(&self) {
        let (fresh, _) = broadcast::channel(EVENT_CAPACITY);
        *self.events.write().await = fresh;
    }

    /// Append a line to a container's output.
    pub async fn write_log(&self, handle: &ContainerHandle, line: impl Into<String>) {
        if let Some(container) = self.state.write().await.containers.get_mut(handle.as_str()) {
            container.logs.push(line.into());
        }
    }

    /// Number of calls made for `op`.
    pub async fn calls(&self, op: Operation) -> usize {
        self.state.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub fn max_observed_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of all containers.
    pub async fn containers(&self) -> Vec<ContainerStatus> {
        let state = self.state.read().await;
        let mut all: Vec<_> = state.containers.values().collect();
        all.sort_by_key(|c| c.seq);
        all.into_iter().map(|c| c.status.clone()).collect()
    }

    /// Running containers belonging to `service`.
    pub async fn running_for(&self, service: &str) -> Vec<ContainerStatus> {
        self.containers()
            .await
            .into_iter()
            .filter(|c| c.state.is_up() && c.service() == Some(service))
            .collect()
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(handle: &ContainerHandle) -> RuntimeError {
    RuntimeError::NotFound(handle.to_string())
}

#[async_trait]
impl RuntimeClient for InMemoryRuntime {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerStatus>> {
        let _call = self.enter(Operation::List).await?;
        Ok(self.containers().await)
    }

    async fn create_container(&self, config: &ContainerConfig) -> RuntimeResult<ContainerHandle> {
        let _call = self.enter(Operation::Create).await?;
        let mut state = self.state.write().await;

        if state.missing_images.contains(&config.image) {
            return Err(RuntimeError::Rejected(format!(
                "image not found: {}",
                config.image
            )));
        }
        if state
            .containers
            .values()
            .any(|c| c.status.name == config.name)
        {
            return Err(RuntimeError::Rejected(format!(
                "container name {} already in use",
                config.name
            )));
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let handle = ContainerHandle::new(format!("{:012x}", 0xc0de_0000_0000u64 + seq));
        state.containers.insert(
            handle.as_str().to_string(),
            MemContainer {
                status: ContainerStatus {
                    handle: handle.clone(),
                    name: config.name.clone(),
                    image: config.image.clone(),
                    state: ContainerState::Created,
                    exit_code: None,
                    address: None,
                    labels: config.labels.clone(),
                },
                seq,
                logs: vec![format!("created from {}", config.image)],
            },
        );
        match Self::lost_reply(&mut state, Operation::Create) {
            Some(error) => Err(error),
            None => Ok(handle),
        }
    }

    async fn start(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        let _call = self.enter(Operation::Start).await?;
        let lost = {
            let mut state = self.state.write().await;
            let container = state
                .containers
                .get_mut(handle.as_str())
                .ok_or_else(|| not_found(handle))?;
            if container.status.state.is_up() {
                return Ok(());
            }
            container.status.state = ContainerState::Running;
            container.status.exit_code = None;
            container.status.address = Some(format!(
                "172.18.{}.{}",
                container.seq / 250,
                container.seq % 250 + 2
            ));
            container.logs.push("started".to_string());
            Self::lost_reply(&mut state, Operation::Start)
        };
        self.emit(RuntimeEvent::Started {
            handle: handle.clone(),
        })
        .await;
        match lost {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> RuntimeResult<()> {
        let _call = self.enter(Operation::Stop).await?;
        let stopped = {
            let mut state = self.state.write().await;
            let container = state
                .containers
                .get_mut(handle.as_str())
                .ok_or_else(|| not_found(handle))?;
            if container.status.state.is_up() {
                container.status.state = ContainerState::Exited;
                container.status.exit_code = Some(0);
                container.logs.push("stopped".to_string());
                true
            } else {
                false
            }
        };
        if stopped {
            self.emit(RuntimeEvent::Died {
                handle: handle.clone(),
                exit_code: Some(0),
            })
            .await;
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        let _call = self.enter(Operation::Remove).await?;
        {
            let mut state = self.state.write().await;
            let container = state
                .containers
                .get(handle.as_str())
                .ok_or_else(|| not_found(handle))?;
            if container.status.state.is_up() {
                return Err(RuntimeError::Rejected(format!(
                    "container {} is running",
                    handle
                )));
            }
            state.containers.remove(handle.as_str());
        }
        self.emit(RuntimeEvent::Destroyed {
            handle: handle.clone(),
        })
        .await;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> RuntimeResult<ContainerStatus> {
        let _call = self.enter(Operation::Inspect).await?;
        let state = self.state.read().await;
        state
            .containers
            .get(handle.as_str())
            .map(|c| c.status.clone())
            .ok_or_else(|| not_found(handle))
    }

    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> RuntimeResult<Vec<String>> {
        let _call = self.enter(Operation::Logs).await?;
        let state = self.state.read().await;
        let container = state
            .containers
            .get(handle.as_str())
            .ok_or_else(|| not_found(handle))?;
        let skip = container.logs.len().saturating_sub(tail);
        Ok(container.logs[skip..].to_vec())
    }

    async fn exec(&self, handle: &ContainerHandle, command: &[String]) -> RuntimeResult<ExecOutput> {
        let _call = self.enter(Operation::Exec).await?;
        let state = self.state.read().await;
        let container = state
            .containers
            .get(handle.as_str())
            .ok_or_else(|| not_found(handle))?;
        if !container.status.state.is_up() {
            return Err(RuntimeError::Rejected(format!(
                "container {} is not running",
                handle
            )));
        }
        Ok(ExecOutput {
            exit_code: state.exec_exit_code,
            output: command.join(" "),
        })
    }

    async fn stream_events(&self) -> RuntimeResult<EventStream> {
        let _call = self.enter(Operation::Events).await?;
        let rx = self.events.read().await.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
