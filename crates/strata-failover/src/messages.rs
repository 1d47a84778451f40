//! Message bodies exchanged with nodes and the cluster manager
//!
//! Only the fields the failover manager acts on. Framing and byte layout
//! belong to the transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{
    ErrorCodeValue, FabricUpgradeSpecification, FabricVersionInstance, FailoverUnitId, NodeInstance,
};

// =============================================================================
// Cluster manager ↔ failover manager
// =============================================================================

/// Cluster manager asks for (or updates) a fabric upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeFabricRequest {
    /// Target version and upgrade attempt
    pub specification: FabricUpgradeSpecification,
    /// How long a node may wait on replica set safety checks
    pub upgrade_replica_set_check_timeout: Duration,
    /// Domains the operator or health monitor has signed off
    pub verified_upgrade_domains: Vec<String>,
    /// Orders updates of the same upgrade attempt
    pub sequence_number: u64,
    /// Whether this attempt rolls back a failed one
    pub is_rollback: bool,
}

impl UpgradeFabricRequest {
    /// Unmonitored request without a replica set check timeout
    pub fn new(specification: FabricUpgradeSpecification) -> Self {
        Self {
            specification,
            upgrade_replica_set_check_timeout: Duration::ZERO,
            verified_upgrade_domains: Vec::new(),
            sequence_number: 0,
            is_rollback: false,
        }
    }
}

/// Progress returned to the cluster manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeFabricReply {
    /// Outcome of the request
    pub error: ErrorCodeValue,
    /// Domains that finished, in upgrade order
    pub completed_upgrade_domains: Vec<String>,
}

// =============================================================================
// Failover manager ↔ node
// =============================================================================

/// Ask a node to move to a fabric version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFabricUpgradeRequest {
    /// Target
    pub specification: FabricUpgradeSpecification,
}

/// Node reports the version it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFabricUpgradeReply {
    /// Version the node reached
    pub version_instance: FabricVersionInstance,
}

/// Node reports it dropped a cancelled upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelFabricUpgradeReply {
    /// Version the node stayed on
    pub version_instance: FabricVersionInstance,
}

/// Node joins, announcing its domain and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpMessage {
    /// Incarnation coming up
    pub node: NodeInstance,
    /// Upgrade domain the node belongs to
    pub upgrade_domain: String,
    /// Version the node runs
    pub version_instance: FabricVersionInstance,
}

/// Answer to [`NodeUpMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpReply {
    /// `InvalidRolloutVersion` when the node must upgrade before joining
    pub error: ErrorCodeValue,
    /// Version the node should run
    pub target_version_instance: FabricVersionInstance,
}

// =============================================================================
// Replica reports
// =============================================================================

/// State of one replica as seen by its node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Partition the replica belongs to
    pub failover_unit_id: FailoverUnitId,
    /// Service owning the partition
    pub service_name: String,
    /// Incarnation of the service description
    pub service_instance: u64,
    /// Update counter within that incarnation
    pub service_update_version: u64,
    /// Node hosting the replica
    pub node: NodeInstance,
    /// Replica identity
    pub replica_id: u64,
    /// Whether the replica runs
    pub is_up: bool,
    /// Whether the replica is gone for good
    pub is_dropped: bool,
}

/// Batch of replica reports sent by a node while it starts up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUpMessage {
    /// Replicas present on the node
    pub replicas: Vec<ReplicaInfo>,
    /// Replicas the node dropped
    pub dropped_replicas: Vec<ReplicaInfo>,
    /// Whether this ends the node's upload
    pub is_last_replica_up_message: bool,
}

/// Aggregated answer for one [`ReplicaUpMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUpReply {
    /// `Success` or the error that failed the batch
    pub error: ErrorCodeValue,
    /// Reports the failover manager applied
    pub processed: Vec<ReplicaInfo>,
    /// Reports the node should treat as dropped
    pub dropped: Vec<ReplicaInfo>,
    /// Acknowledges the last message of the upload
    pub is_last_replica_up_message: bool,
}
