//! Upgrade status signal for placement and load balancing

use std::collections::BTreeSet;

/// Told whenever cluster upgrade status changes so placement avoids domains
/// that are being upgraded
pub trait PlacementSignal: Send + Sync {
    /// `completed_domains` is empty once the upgrade is over
    fn update_cluster_upgrade(&self, in_progress: bool, completed_domains: BTreeSet<String>);
}
