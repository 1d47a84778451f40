//! Node and failover unit identifiers

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a node across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u128);

impl NodeId {
    /// Create a node id from its raw value
    pub const fn new(value: u128) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One incarnation of a node; the instance id grows every time the node restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Node identity
    pub id: NodeId,
    /// Incarnation counter
    pub instance_id: u64,
}

impl NodeInstance {
    /// Create a node instance
    pub const fn new(id: NodeId, instance_id: u64) -> Self {
        Self { id, instance_id }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance_id)
    }
}

/// Identity of one partition's replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailoverUnitId(Uuid);

impl FailoverUnitId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Deterministic id derived from a partition name
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// Underlying UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FailoverUnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FailoverUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
