//! Berth daemon library
//!
//! Configuration loading and the assembly of runtime client, event bus,
//! health monitor, proxy synchronizer and reconciler behind `berthd`.

pub mod config;
pub mod daemon;
pub mod error;

pub use config::{BerthConfig, EngineKind};
pub use daemon::{shutdown_signal, Daemon};
pub use error::{DaemonError, DaemonResult};
