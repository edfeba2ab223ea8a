//! # Berth Health - Probing managed containers
//!
//! The health monitor runs one independent probe cycle per registered
//! instance and classifies it with hysteresis: an instance only becomes
//! `unhealthy` after `failure_threshold` consecutive failures and only becomes
//! `healthy` after `success_threshold` consecutive successes.
//!
//! ## Key Components
//!
//! - [`HealthMonitor`]: per-instance probe tasks, records, `HealthChanged` events
//! - [`probes`]: TCP connect, HTTP GET and exec-command strategies
//!
//! A probe that errors or times out counts as a failed probe. Nothing a probe
//! does can take the monitor down.

#![deny(unsafe_code)]

pub mod error;
pub mod monitor;
pub mod probes;

pub use error::{HealthError, HealthResult};
pub use monitor::{HealthMonitor, HealthMonitorConfig};
pub use probes::{ExecProbe, HttpProbe, Probe, ProbeFactory, ProbeResult, ProbeTarget, TcpProbe};
