//! Configuration for berthd
//!
//! Layered as built-in defaults, then an optional file, then `BERTH_`
//! environment variables (`BERTH_RECONCILER__WORKERS=8`).

use crate::error::{DaemonError, DaemonResult};
use berth_events::{BusConfig, DEFAULT_CAPACITY};
use berth_health::HealthMonitorConfig;
use berth_proxy::SyncConfig;
use berth_reconciler::{ReconcilerConfig, RestartBudget, RetryPolicy};
use berth_runtime::RuntimeLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub reconciler: ReconcilerSection,

    #[serde(default)]
    pub health: HealthSection,

    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub events: EventsSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which container engine backs the runtime client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Docker,
    /// In-process engine, useful for dry runs
    Memory,
}

/// Container engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub kind: EngineKind,

    /// Path or name of the docker CLI
    pub docker_binary: String,

    /// Deadline for a single engine call
    pub call_timeout_secs: u64,

    pub max_concurrent_calls: usize,

    /// Grace period before a stopping container is killed
    pub stop_grace_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            kind: EngineKind::Docker,
            docker_binary: "docker".to_string(),
            call_timeout_secs: 30,
            max_concurrent_calls: 8,
            stop_grace_secs: 10,
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSection {
    pub tick_interval_secs: u64,

    /// Services reconciled concurrently
    pub workers: usize,

    pub retry_base_delay_ms: u64,
    pub retry_max_delay_secs: u64,
    pub retry_max_attempts: u32,

    /// Restarts allowed within `restart_window_secs`
    pub max_restarts: u32,
    pub restart_window_secs: u64,

    /// Uptime after which the restart history is forgotten
    pub restart_reset_after_secs: u64,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_secs: u64,

    pub retained_log_lines: usize,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            workers: 4,
            retry_base_delay_ms: 1000,
            retry_max_delay_secs: 60,
            retry_max_attempts: 5,
            max_restarts: 5,
            restart_window_secs: 600,
            restart_reset_after_secs: 300,
            restart_base_delay_ms: 1000,
            restart_max_delay_secs: 120,
            retained_log_lines: 100,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub max_concurrent_probes: usize,
    pub http_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 64,
            http_timeout_secs: 5,
        }
    }
}

/// Proxy control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Control endpoint; routing is disabled when unset
    pub endpoint: Option<String>,

    pub push_timeout_secs: u64,

    /// Interval of forced pushes
    pub resync_interval_secs: u64,

    pub debounce_ms: u64,
    pub retry_interval_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            endpoint: None,
            push_timeout_secs: 5,
            resync_interval_secs: 60,
            debounce_ms: 100,
            retry_interval_secs: 5,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Queue depth per subscriber
    pub capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Spec store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// JSON file holding applied specs; specs live in memory when unset
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl BerthConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> DaemonResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&BerthConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BERTH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: BerthConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> DaemonResult<()> {
        let checks = [
            (self.runtime.max_concurrent_calls == 0, "runtime.max_concurrent_calls must be positive"),
            (self.runtime.call_timeout_secs == 0, "runtime.call_timeout_secs must be positive"),
            (self.reconciler.workers == 0, "reconciler.workers must be positive"),
            (self.reconciler.tick_interval_secs == 0, "reconciler.tick_interval_secs must be positive"),
            (self.health.max_concurrent_probes == 0, "health.max_concurrent_probes must be positive"),
            (self.events.capacity == 0, "events.capacity must be positive"),
        ];
        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(DaemonError::Config(message.to_string()));
        }
        match &self.proxy.endpoint {
            Some(endpoint)
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) =>
            {
                Err(DaemonError::Config(format!(
                    "proxy.endpoint must be an http(s) URL, got {}",
                    endpoint
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn runtime_limits(&self) -> RuntimeLimits {
        RuntimeLimits {
            call_timeout: Duration::from_secs(self.runtime.call_timeout_secs),
            max_concurrent_calls: self.runtime.max_concurrent_calls,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let r = &self.reconciler;
        ReconcilerConfig {
            tick_interval: Duration::from_secs(r.tick_interval_secs),
            workers: r.workers,
            stop_grace: Duration::from_secs(self.runtime.stop_grace_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(r.retry_base_delay_ms),
                max_delay: Duration::from_secs(r.retry_max_delay_secs),
                max_attempts: r.retry_max_attempts,
            },
            restart: RestartBudget {
                max_restarts: r.max_restarts,
                window: Duration::from_secs(r.restart_window_secs),
                reset_after: Duration::from_secs(r.restart_reset_after_secs),
                base_delay: Duration::from_millis(r.restart_base_delay_ms),
                max_delay: Duration::from_secs(r.restart_max_delay_secs),
            },
            retained_log_lines: r.retained_log_lines,
            ..ReconcilerConfig::default()
        }
    }

    pub fn health_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            max_concurrent_probes: self.health.max_concurrent_probes,
            http_timeout: Duration::from_secs(self.health.http_timeout_secs),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            push_timeout: Duration::from_secs(self.proxy.push_timeout_secs),
            resync_interval: Duration::from_secs(self.proxy.resync_interval_secs),
            debounce: Duration::from_millis(self.proxy.debounce_ms),
            retry_interval: Duration::from_secs(self.proxy.retry_interval_secs),
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            capacity: self.events.capacity,
        }
    }
}
