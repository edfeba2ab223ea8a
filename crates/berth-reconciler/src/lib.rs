//! # Berth Reconciler - Converging containers towards applied specs
//!
//! The reconciler owns the desired state. `apply` and `remove` change it,
//! `reconcile` compares it against what the container engine reports and
//! repairs drift, and the background loops react to container exits and
//! health changes between passes.
//!
//! ## Guarantees
//!
//! - One writer per service name at a time; transitions for an instance are
//!   strictly ordered.
//! - Transient runtime failures are retried with capped backoff and never
//!   fail a pass; deterministic failures park the instance in `failed`.
//! - Replacing a running service is make-before-break: the previous
//!   instance is torn down only once the new one is routable.
//!
//! ## Example
//!
//! ```ignore
//! let reconciler = Arc::new(
//!     Reconciler::new(config, runtime, monitor, bus, store).with_proxy(synchronizer),
//! );
//! reconciler.restore().await?;
//! tokio::spawn(reconciler.clone().run(shutdown_rx));
//! reconciler.apply(spec).await?;
//! ```

#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod error;
mod lifecycle;
pub mod reconciler;
mod slot;
pub mod store;
mod watch;

pub use config::{ReconcilerConfig, RestartBudget, RetryPolicy};
pub use error::{ReconcileError, ReconcileResult, StoreError, StoreResult};
pub use reconciler::{ReconcileReport, Reconciler, ServiceError};
pub use slot::RetainedLogs;
pub use store::{InMemorySpecStore, JsonFileSpecStore, SpecStore};
