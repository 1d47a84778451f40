//! Fabric upgrade message staleness
//!
//! A node can receive upgrade messages for attempts it already finished, for
//! older attempts delivered late, or for attempts it has never seen. Only the
//! last kind starts a state machine.

use strata_core::{FabricUpgradeSpecification, FabricVersionInstance};

/// Decision for an incoming fabric upgrade message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricUpgradeStalenessCheckResult {
    /// Start an upgrade state machine
    UpgradeRequired,
    /// Reply with the node's version without upgrading
    UpgradeNotRequired,
    /// Same instance, different version: the failover manager is inconsistent
    Assert,
}

/// Classify `incoming` against the version the node runs
pub fn check_fabric_upgrade_at_upgrade_message(
    node_version: &FabricVersionInstance,
    incoming: &FabricUpgradeSpecification,
) -> FabricUpgradeStalenessCheckResult {
    use FabricUpgradeStalenessCheckResult::*;
    if node_version.instance_id > incoming.instance_id {
        return UpgradeNotRequired;
    }
    if node_version.instance_id == incoming.instance_id {
        return if node_version.version == incoming.version {
            UpgradeNotRequired
        } else {
            Assert
        };
    }
    UpgradeRequired
}

/// Whether a cancel for `incoming` still concerns this node
pub fn is_cancel_relevant(
    node_version: &FabricVersionInstance,
    incoming: &FabricUpgradeSpecification,
) -> bool {
    node_version.instance_id < incoming.instance_id
}
