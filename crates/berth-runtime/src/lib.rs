//! Berth Runtime - Container engine capability
//!
//! ## Key Components
//!
//! - [`RuntimeClient`]: the capability interface the reconciler consumes
//! - [`GuardedRuntime`]: per-call deadline and bounded concurrency for any engine
//! - [`InMemoryRuntime`]: map-backed engine with fault injection
//! - [`DockerCliRuntime`]: drives the local `docker` binary
//!
//! Errors are split into transient (`Unavailable`, `Timeout`) and
//! deterministic (`Rejected`, `NotFound`); callers decide whether to retry
//! with [`RuntimeError::is_transient`].

#![deny(unsafe_code)]

pub mod client;
pub mod docker;
pub mod error;
pub mod guarded;
pub mod memory;

pub use client::{
    ContainerConfig, ContainerState, ContainerStatus, EventStream, ExecOutput, RuntimeClient,
    RuntimeEvent,
};
pub use docker::DockerCliRuntime;
pub use error::{RuntimeError, RuntimeResult};
pub use guarded::{GuardedRuntime, RuntimeLimits};
pub use memory::{InMemoryRuntime, Operation};
