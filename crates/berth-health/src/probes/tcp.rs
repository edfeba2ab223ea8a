//! TCP connect probe

use super::{elapsed_ms, Probe, ProbeResult, ProbeTarget};
use crate::error::HealthResult;
use async_trait::async_trait;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Succeeds when a connection can be established; the connection is closed immediately
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn execute(&self, target: &ProbeTarget) -> HealthResult<ProbeResult> {
        let addr = format!("{}:{}", target.address()?, self.port);
        let started = Instant::now();
        match TcpStream::connect(&addr).await {
            Ok(mut stream) => {
                let _ = stream.shutdown().await;
                Ok(ProbeResult::success(elapsed_ms(started)))
            }
            Err(e) => Ok(ProbeResult::failure(
                format!("connect to {} failed: {}", addr, e),
                elapsed_ms(started),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_types::InstanceId;
    use tokio::net::TcpListener;

    fn target() -> ProbeTarget {
        ProbeTarget {
            instance_id: InstanceId::generate(),
            address: Some("127.0.0.1".into()),
            container: None,
        }
    }

    #[tokio::test]
    async fn test_open_port_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = TcpProbe::new(port).execute(&target()).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = TcpProbe::new(port).execute(&target()).await.unwrap();
        assert!(!result.success);
        assert!(result.message.unwrap().contains("connect"));
    }

    #[tokio::test]
    async fn test_missing_address_is_an_error() {
        let mut target = target();
        target.address = None;
        assert!(TcpProbe::new(80).execute(&target).await.is_err());
    }
}
