//! Docker engine driven through the `docker` command line
//!
//! Each operation is one CLI invocation. Failures are classified from the
//! exit status and stderr: unreachable daemon is transient, a missing image
//! or conflicting name is a rejection.

use crate::client::{
    ContainerConfig, ContainerState, ContainerStatus, EventStream, ExecOutput, RuntimeClient,
    RuntimeEvent,
};
use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use berth_types::{ContainerHandle, LABEL_SERVICE};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Engine backed by the local docker CLI
pub struct DockerCliRuntime {
    binary: String,
}

struct CliOutput {
    success: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> RuntimeResult<CliOutput> {
        debug!(binary = %self.binary, ?args, "Running docker command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("failed to run {}: {}", self.binary, e)))?;

        Ok(CliOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and require a zero exit status.
    async fn run_ok(&self, args: &[String]) -> RuntimeResult<String> {
        let output = self.run(args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&output.stderr))
        }
    }

    async fn inspect_many(&self, ids: &[String]) -> RuntimeResult<Vec<ContainerStatus>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string()];
        args.extend(ids.iter().cloned());
        let stdout = self.run_ok(&args).await?;
        parse_inspect(&stdout)
    }
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Map CLI stderr onto the runtime error taxonomy.
fn classify_failure(stderr: &str) -> RuntimeError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        RuntimeError::NotFound(message)
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("connection refused")
        || lower.contains("context deadline exceeded")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake timeout")
        || lower.contains("is the docker daemon running")
    {
        RuntimeError::Unavailable(message)
    } else {
        RuntimeError::Rejected(message)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    networks: BTreeMap<String, InspectEndpoint>,
}

#[derive(Deserialize)]
struct InspectEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

fn parse_inspect(stdout: &str) -> RuntimeResult<Vec<ContainerStatus>> {
    let docs: Vec<InspectDoc> = serde_json::from_str(stdout)
        .map_err(|e| RuntimeError::Unavailable(format!("unreadable inspect output: {}", e)))?;

    Ok(docs
        .into_iter()
        .map(|doc| {
            let state = ContainerState::parse(&doc.state.status);
            let address = doc.network_settings.and_then(|net| {
                if !net.ip_address.is_empty() {
                    return Some(net.ip_address);
                }
                net.networks
                    .into_values()
                    .map(|endpoint| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            });
            ContainerStatus {
                handle: ContainerHandle::new(doc.id),
                name: doc.name.trim_start_matches('/').to_string(),
                image: doc.config.image,
                exit_code: matches!(state, ContainerState::Exited | ContainerState::Dead)
                    .then_some(doc.state.exit_code),
                state,
                address,
                labels: doc.config.labels.unwrap_or_default(),
            }
        })
        .collect())
}

#[derive(Deserialize)]
struct EventLine {
    #[serde(default, rename = "Action")]
    action: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    id: String,
    #[serde(default, rename = "Actor")]
    actor: Option<EventActor>,
}

#[derive(Deserialize)]
struct EventActor {
    #[serde(default, rename = "ID")]
    id: String,
    #[serde(default, rename = "Attributes")]
    attributes: BTreeMap<String, String>,
}

/// Parse one `docker events --format '{{json .}}'` line.
fn parse_event(line: &str) -> Option<RuntimeEvent> {
    let event: EventLine = serde_json::from_str(line).ok()?;
    let action = if event.action.is_empty() {
        event.status
    } else {
        event.action
    };
    let (actor_id, exit_code) = match &event.actor {
        Some(actor) => (
            actor.id.clone(),
            actor
                .attributes
                .get("exitCode")
                .and_then(|code| code.parse().ok()),
        ),
        None => (String::new(), None),
    };
    let id = if event.id.is_empty() { actor_id } else { event.id };
    if id.is_empty() {
        return None;
    }
    let handle = ContainerHandle::new(id);
    match action.as_str() {
        "start" => Some(RuntimeEvent::Started { handle }),
        "die" => Some(RuntimeEvent::Died { handle, exit_code }),
        "destroy" => Some(RuntimeEvent::Destroyed { handle }),
        _ => None,
    }
}

#[async_trait]
impl RuntimeClient for DockerCliRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerStatus>> {
        let stdout = self
            .run_ok(&args(["ps", "--all", "--no-trunc", "--format", "{{.ID}}"]))
            .await?;
        let ids: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        self.inspect_many(&ids).await
    }

    #[instrument(skip(self, config), fields(name = %config.name, image = %config.image))]
    async fn create_container(&self, config: &ContainerConfig) -> RuntimeResult<ContainerHandle> {
        let mut cmd = args(["create", "--name"]);
        cmd.push(config.name.clone());
        for (key, value) in &config.labels {
            cmd.push("--label".into());
            cmd.push(format!("{}={}", key, value));
        }
        for (key, value) in &config.env {
            cmd.push("--env".into());
            cmd.push(format!("{}={}", key, value));
        }
        for port in &config.ports {
            cmd.push("--publish".into());
            match port.host_port {
                Some(host) => cmd.push(format!("{}:{}/{}", host, port.container_port, port.protocol)),
                None => cmd.push(format!("{}/{}", port.container_port, port.protocol)),
            }
        }
        for volume in &config.volumes {
            cmd.push("--volume".into());
            let mode = if volume.read_only { ":ro" } else { "" };
            cmd.push(format!("{}:{}{}", volume.source, volume.target, mode));
        }
        cmd.push(config.image.clone());

        let stdout = self.run_ok(&cmd).await?;
        let id = stdout.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Unavailable(
                "docker create returned no container id".into(),
            ));
        }
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.run_ok(&args(["start", handle.as_str()])).await?;
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> RuntimeResult<()> {
        let secs = grace.as_secs().to_string();
        self.run_ok(&args(["stop", "--time", secs.as_str(), handle.as_str()]))
            .await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.run_ok(&args(["rm", handle.as_str()])).await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> RuntimeResult<ContainerStatus> {
        self.inspect_many(&[handle.as_str().to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> RuntimeResult<Vec<String>> {
        let tail = tail.to_string();
        let output = self
            .run(&args(["logs", "--tail", tail.as_str(), handle.as_str()]))
            .await?;
        if !output.success {
            return Err(classify_failure(&output.stderr));
        }
        // Container stderr arrives on our stderr; keep both.
        Ok(output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(String::from)
            .collect())
    }

    async fn exec(&self, handle: &ContainerHandle, command: &[String]) -> RuntimeResult<ExecOutput> {
        let mut cmd = args(["exec", handle.as_str()]);
        cmd.extend(command.iter().cloned());
        let output = self.run(&cmd).await?;
        match output.exit_code {
            // 125: docker itself failed; 126/127: command not runnable.
            Some(125) => Err(classify_failure(&output.stderr)),
            Some(code) => Ok(ExecOutput {
                exit_code: code as i64,
                output: output.stdout,
            }),
            None => Err(RuntimeError::Unavailable(
                "docker exec terminated by signal".into(),
            )),
        }
    }

    async fn stream_events(&self) -> RuntimeResult<EventStream> {
        let filter = format!("label={}", LABEL_SERVICE);
        let mut child = Command::new(&self.binary)
            .args([
                "events",
                "--format",
                "{{json .}}",
                "--filter",
                "type=container",
                "--filter",
                filter.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to run docker events: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Unavailable("docker events has no stdout".into()))?;
        let lines = BufReader::new(stdout).lines();

        // The child handle rides along so the process lives as long as the stream.
        let stream = stream::unfold((lines, child), |(mut lines, child)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_event(&line) {
                            return Some((Ok(event), (lines, child)));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(error = %e, "docker events stream failed");
                        return None;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
