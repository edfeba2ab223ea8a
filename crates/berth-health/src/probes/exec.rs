//! Exec-command probe run inside the container

use super::{elapsed_ms, Probe, ProbeResult, ProbeTarget};
use crate::error::HealthResult;
use async_trait::async_trait;
use berth_runtime::RuntimeClient;
use std::sync::Arc;
use std::time::Instant;

/// Succeeds when the command exits with code zero
pub struct ExecProbe {
    runtime: Arc<dyn RuntimeClient>,
    command: Vec<String>,
}

impl ExecProbe {
    pub fn new(runtime: Arc<dyn RuntimeClient>, command: Vec<String>) -> Self {
        Self { runtime, command }
    }
}

#[async_trait]
impl Probe for ExecProbe {
    fn kind(&self) -> &'static str {
        "exec"
    }

    async fn execute(&self, target: &ProbeTarget) -> HealthResult<ProbeResult> {
        let container = target.container()?;
        let started = Instant::now();
        match self.runtime.exec(container, &self.command).await {
            Ok(output) if output.exit_code == 0 => Ok(ProbeResult::success(elapsed_ms(started))),
            Ok(output) => Ok(ProbeResult::failure(
                format!("{:?} exited with {}", self.command, output.exit_code),
                elapsed_ms(started),
            )),
            Err(e) => Ok(ProbeResult::failure(e.to_string(), elapsed_ms(started))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::{ContainerConfig, InMemoryRuntime};
    use berth_types::{InstanceId, ServiceSpec};

    #[tokio::test]
    async fn test_exit_code_decides() {
        let engine = Arc::new(InMemoryRuntime::new());
        let id = InstanceId::generate();
        let config = ContainerConfig::from_spec(&ServiceSpec::new("web", "nginx"), &id, "fp");
        let handle = engine.create_container(&config).await.unwrap();
        engine.start(&handle).await.unwrap();

        let probe = ExecProbe::new(engine.clone(), vec!["pg_isready".into()]);
        let target = ProbeTarget {
            instance_id: id,
            address: None,
            container: Some(handle),
        };
        assert!(probe.execute(&target).await.unwrap().success);

        engine.set_exec_exit_code(2).await;
        assert!(!probe.execute(&target).await.unwrap().success);
    }
}
