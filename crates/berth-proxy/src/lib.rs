//! Berth Proxy - Keeping a reverse proxy's routes in step with the fleet
//!
//! A route exists for a service exactly when its instance is running and,
//! if the service declares a health check, classified healthy. The route
//! table is derived from the reconciler's view on every relevant event and
//! pushed whole; the proxy never sees a partial route set.
//!
//! ## Key Components
//!
//! - [`ProxySynchronizer`]: diff, atomic push, last-good retention
//! - [`SyncDriver`]: bus-triggered sync loop with coalescing, retry and a safety-net tick
//! - [`ProxyControl`]: the proxy's control endpoint ([`HttpProxyControl`], [`MemoryProxy`])

#![deny(unsafe_code)]

pub mod control;
pub mod driver;
pub mod error;
pub mod sync;

pub use control::{HttpProxyControl, MemoryProxy, ProxyControl, RouteDocument};
pub use driver::SyncDriver;
pub use error::{ProxyError, ProxyResult};
pub use sync::{ProxySynchronizer, SyncConfig, SyncFailure, SyncOutcome, SyncStatus, ViewSource};
