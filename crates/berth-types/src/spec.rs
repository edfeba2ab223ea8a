//! Service specifications
//!
//! A ServiceSpec is the operator's declared intent for one service. Specs are
//! never patched: an update replaces the whole value.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of a service name (DNS label).
pub const MAX_NAME_LEN: usize = 63;

/// Declared intent for a single service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique, stable service name
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Port mappings
    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Volume mounts
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    /// Restart policy applied when the container exits unexpectedly
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Health check; `None` disables health gating
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,

    /// Reverse-proxy routing rule; `None` means the service is not routed
    #[serde(default)]
    pub route: Option<RouteRule>,
}

impl ServiceSpec {
    /// Minimal spec with only a name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            restart_policy: RestartPolicy::default(),
            health_check: None,
            route: None,
        }
    }

    pub fn with_port(mut self, port: PortMapping) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn with_route(mut self, route: RouteRule) -> Self {
        self.route = Some(route);
        self
    }

    /// Whether routing for this service is gated on health.
    pub fn health_gated(&self) -> bool {
        self.health_check.is_some()
    }

    /// Content hash of the spec, stable across processes.
    ///
    /// Map fields are ordered, so the JSON encoding is canonical.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let hash = blake3::hash(&encoded);
        hash.to_hex()[..16].to_string()
    }

    /// Validate the spec.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        validate_name(&self.name)?;

        if self.image.trim().is_empty() || self.image.chars().any(char::is_whitespace) {
            return Err(SpecValidationError::InvalidImage(self.image.clone()));
        }

        let mut container_ports = HashSet::new();
        let mut host_ports = HashSet::new();
        for port in &self.ports {
            if port.container_port == 0 {
                return Err(SpecValidationError::InvalidPort(
                    "container port must be > 0".into(),
                ));
            }
            if !container_ports.insert((port.container_port, port.protocol)) {
                return Err(SpecValidationError::ConflictingPorts(format!(
                    "container port {}/{} mapped twice",
                    port.container_port, port.protocol
                )));
            }
            if let Some(host_port) = port.host_port {
                if host_port == 0 {
                    return Err(SpecValidationError::InvalidPort(
                        "host port must be > 0".into(),
                    ));
                }
                if !host_ports.insert((host_port, port.protocol)) {
                    return Err(SpecValidationError::ConflictingPorts(format!(
                        "host port {}/{} bound twice",
                        host_port, port.protocol
                    )));
                }
            }
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(SpecValidationError::InvalidEnv(key.clone()));
            }
        }

        let mut targets = HashSet::new();
        for volume in &self.volumes {
            if volume.source.trim().is_empty() {
                return Err(SpecValidationError::InvalidVolume(
                    "volume source is empty".into(),
                ));
            }
            if !volume.target.starts_with('/') {
                return Err(SpecValidationError::InvalidVolume(format!(
                    "volume target {} is not absolute",
                    volume.target
                )));
            }
            if !targets.insert(volume.target.as_str()) {
                return Err(SpecValidationError::InvalidVolume(format!(
                    "volume target {} mounted twice",
                    volume.target
                )));
            }
        }

        if let Some(check) = &self.health_check {
            check.validate()?;
        }

        if let Some(route) = &self.route {
            if route.host.trim().is_empty() {
                return Err(SpecValidationError::InvalidRoute("host is empty".into()));
            }
            if !route.path.starts_with('/') {
                return Err(SpecValidationError::InvalidRoute(format!(
                    "path {} must start with '/'",
                    route.path
                )));
            }
            if !container_ports.contains(&(route.target_port, Protocol::Tcp)) {
                return Err(SpecValidationError::InvalidRoute(format!(
                    "target port {} is not an exposed tcp container port",
                    route.target_port
                )));
            }
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), SpecValidationError> {
    if name.is_empty() {
        return Err(SpecValidationError::EmptyName);
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if name.len() > MAX_NAME_LEN || !valid_chars || name.starts_with('-') || name.ends_with('-')
    {
        return Err(SpecValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Container port, optionally published on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: Protocol::Tcp,
        }
    }

    pub fn published(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port: Some(host_port),
            protocol: Protocol::Tcp,
        }
    }
}

/// Bind mount or named volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// What to do when a running container exits unexpectedly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    #[default]
    OnFailure,
    Always,
}

impl RestartPolicy {
    /// Whether an exit with the given code should be restarted.
    ///
    /// An unknown exit code counts as a failure.
    pub fn should_restart(&self, exit_code: Option<i64>) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => exit_code != Some(0),
            RestartPolicy::Always => true,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Health check definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Probe strategy
    pub probe: ProbeSpec,

    /// Time between probes
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// Per-probe timeout; a timed-out probe is a failure
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Consecutive failures before classifying unhealthy
    pub failure_threshold: u32,

    /// Consecutive successes before classifying healthy
    pub success_threshold: u32,
}

impl HealthCheckSpec {
    /// Check with the common defaults: 10s interval, 2s timeout, 3 failures, 1 success.
    pub fn new(probe: ProbeSpec) -> Self {
        Self {
            probe,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
            success_threshold: 1,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, failure_threshold: u32, success_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self.success_threshold = success_threshold;
        self
    }

    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.interval.is_zero() {
            return Err(SpecValidationError::InvalidHealthCheck(
                "interval must be > 0".into(),
            ));
        }
        if self.timeout.is_zero() || self.timeout > self.interval {
            return Err(SpecValidationError::InvalidHealthCheck(
                "timeout must be > 0 and no longer than the interval".into(),
            ));
        }
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(SpecValidationError::InvalidHealthCheck(
                "thresholds must be >= 1".into(),
            ));
        }
        match &self.probe {
            ProbeSpec::Tcp { port } | ProbeSpec::Http { port, .. } if *port == 0 => Err(
                SpecValidationError::InvalidHealthCheck("probe port must be > 0".into()),
            ),
            ProbeSpec::Http { path, status, .. } => {
                if !path.starts_with('/') {
                    return Err(SpecValidationError::InvalidHealthCheck(format!(
                        "http probe path {} must start with '/'",
                        path
                    )));
                }
                if status.min < 100 || status.max > 599 || status.min > status.max {
                    return Err(SpecValidationError::InvalidHealthCheck(format!(
                        "invalid status range {}-{}",
                        status.min, status.max
                    )));
                }
                Ok(())
            }
            ProbeSpec::Exec { command } if command.is_empty() => Err(
                SpecValidationError::InvalidHealthCheck("exec command is empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Probe strategy selected by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeSpec {
    /// Connect and immediately close
    Tcp { port: u16 },

    /// GET a path and check the status code
    Http {
        port: u16,
        #[serde(default = "default_probe_path")]
        path: String,
        #[serde(default)]
        status: StatusRange,
    },

    /// Run a command inside the container; exit code 0 is success
    Exec { command: Vec<String> },
}

impl ProbeSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeSpec::Tcp { .. } => "tcp",
            ProbeSpec::Http { .. } => "http",
            ProbeSpec::Exec { .. } => "exec",
        }
    }
}

fn default_probe_path() -> String {
    "/".to_string()
}

/// Inclusive range of accepted HTTP status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRange {
    pub min: u16,
    pub max: u16,
}

impl StatusRange {
    pub fn contains(&self, status: u16) -> bool {
        (self.min..=self.max).contains(&status)
    }
}

impl Default for StatusRange {
    fn default() -> Self {
        Self { min: 200, max: 399 }
    }
}

/// Host/path to container-port routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub host: String,
    #[serde(default = "default_probe_path")]
    pub path: String,
    pub target_port: u16,
}

impl RouteRule {
    pub fn new(host: impl Into<String>, path: impl Into<String>, target_port: u16) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            target_port,
        }
    }
}

/// Spec validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecValidationError {
    #[error("service name is empty")]
    EmptyName,

    #[error("invalid service name: {0}")]
    InvalidName(String),

    #[error("invalid image reference: {0:?}")]
    InvalidImage(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("conflicting port mappings: {0}")]
    ConflictingPorts(String),

    #[error("invalid environment variable name: {0:?}")]
    InvalidEnv(String),

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("invalid health check: {0}")]
    InvalidHealthCheck(String),

    #[error("invalid route: {0}")]
    InvalidRoute(String),
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
