//! HTTP GET probe

use super::{elapsed_ms, Probe, ProbeResult, ProbeTarget};
use crate::error::HealthResult;
use async_trait::async_trait;
use berth_types::StatusRange;
use std::time::Instant;

/// Succeeds when a GET returns a status inside the accepted range
pub struct HttpProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
    status: StatusRange,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, port: u16, path: String, status: StatusRange) -> Self {
        Self {
            client,
            port,
            path,
            status,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, target: &ProbeTarget) -> HealthResult<ProbeResult> {
        let url = format!("http://{}:{}{}", target.address()?, self.port, self.path);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if self.status.contains(status) {
                    Ok(ProbeResult::success(elapsed_ms(started)))
                } else {
                    Ok(ProbeResult::failure(
                        format!("GET {} returned {}", url, status),
                        elapsed_ms(started),
                    ))
                }
            }
            Err(e) => Ok(ProbeResult::failure(
                format!("GET {} failed: {}", url, e),
                elapsed_ms(started),
            )),
        }
    }
}
