//! Berth Events - In-process publish/subscribe for lifecycle and health events
//!
//! Publishers never wait on subscribers. Each subscriber has a bounded queue
//! per topic; on overflow the oldest unread event is dropped and the bus-wide
//! backpressure counter is incremented. Consumers that need durability poll
//! the reconciler for authoritative state.

#![deny(unsafe_code)]

pub mod bus;

pub use bus::{BusConfig, BusMetrics, EventBus, Subscription, DEFAULT_CAPACITY};
