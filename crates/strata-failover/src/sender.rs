//! Outbound messages from the failover manager to nodes

use strata_core::NodeInstance;

use crate::messages::{NodeFabricUpgradeRequest, ReplicaUpReply};

/// Federation transport towards nodes
///
/// Sends are fire and forget; nodes retry on their side.
pub trait NodeSender: Send + Sync {
    /// Ask `node` to upgrade
    fn send_node_fabric_upgrade(&self, node: NodeInstance, request: NodeFabricUpgradeRequest);

    /// Answer a replica up batch
    fn send_replica_up_reply(&self, node: NodeInstance, reply: ReplicaUpReply);
}
