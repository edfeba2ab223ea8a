//! Berth Types - Shared data model for the container fleet reconciler
//!
//! Berth keeps a single node's containers converged on a set of declared
//! service specs, probes their health, and keeps a reverse proxy's routes in
//! step with what is actually serving.
//!
//! ## Key Concepts
//!
//! - **ServiceSpec**: declared intent, replaced wholesale on update
//! - **ServiceInstance**: runtime-observed state with a strict lifecycle
//! - **HealthRecord**: rolling probe results with hysteresis
//! - **RouteTable**: derived from specs, instances and health; never declared
//! - **Events**: typed topics carried by the in-process bus

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod health;
pub mod ids;
pub mod instance;
pub mod route;
pub mod spec;

pub use events::{BerthEvent, EventEnvelope, EventSource, Topic};
pub use health::{HealthClassification, HealthRecord, Thresholds};
pub use ids::{ContainerHandle, InstanceId};
pub use instance::{LifecycleState, ServiceInstance, TransitionError};
pub use route::{RouteDiff, RouteEntry, RouteKey, RouteTable, ServiceView};
pub use spec::{
    HealthCheckSpec, PortMapping, ProbeSpec, Protocol, RestartPolicy, RouteRule, ServiceSpec,
    SpecValidationError, StatusRange, VolumeMount,
};

/// Label carrying the owning service name.
pub const LABEL_SERVICE: &str = "berth.service";

/// Label carrying the instance id.
pub const LABEL_INSTANCE: &str = "berth.instance";

/// Label carrying the spec fingerprint.
pub const LABEL_FINGERPRINT: &str = "berth.fingerprint";
