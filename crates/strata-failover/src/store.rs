//! Persistence seam of the failover manager
//!
//! Each call is atomic and durable before it returns `Ok`. Failures are
//! returned unchanged; callers above decide whether a retry makes sense.

use strata_core::{FabricVersionInstance, Result};

use crate::fabric_upgrade::FabricUpgrade;
use crate::failover_unit::FailoverUnit;
use crate::node_cache::NodeInfo;

/// Replicated store used by the failover manager
pub trait FailoverStore: Send + Sync {
    /// Insert, update or delete the upgrade record per its persistence state
    fn update_fabric_upgrade(&self, upgrade: &FabricUpgrade) -> Result<()>;

    /// Record the version the cluster completed
    fn update_fabric_version_instance(&self, version: &FabricVersionInstance) -> Result<()>;

    /// Write a node record
    fn update_node(&self, node: &NodeInfo) -> Result<()>;

    /// Write a failover unit record
    fn update_failover_unit(&self, unit: &FailoverUnit) -> Result<()>;
}
