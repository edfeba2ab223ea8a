//! Strongly-typed identifiers for Berth entities
//!
//! Instance IDs are UUID-based; container handles are opaque strings owned by
//! the runtime engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse the form produced by `Display` or a bare UUID.
    pub fn parse(value: &str) -> Option<Self> {
        let raw = value.strip_prefix("instance:").unwrap_or(value);
        Uuid::parse_str(raw).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex characters, used in container names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance:{}", self.0)
    }
}

/// Opaque reference to a container, issued by the runtime engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
