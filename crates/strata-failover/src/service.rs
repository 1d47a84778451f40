//! Service descriptions and in-build failover units
//!
//! Both caches live outside the upgrade engine; replica reconciliation reads
//! service descriptions to reject reports for old incarnations and hands
//! reports for units it does not know to the in-build cache.

use serde::{Deserialize, Serialize};
use strata_core::{NodeInstance, Result};

use crate::messages::ReplicaInfo;

/// Service description as far as replica reconciliation cares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name
    pub name: String,
    /// Incarnation; recreating the service bumps it
    pub instance: u64,
    /// Description updates within the incarnation
    pub update_version: u64,
    /// Whether the service is being deleted
    pub is_to_be_deleted: bool,
}

/// Service description lookup
pub trait ServiceLookup: Send + Sync {
    /// Description of `name`
    fn get_service(&self, name: &str) -> Option<ServiceInfo>;

    /// Record a newer update version of the same incarnation
    fn update_service_version(&self, name: &str, instance: u64, update_version: u64) -> Result<()>;
}

/// What the in-build cache did with a report for an unknown unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InBuildOutcome {
    /// The unit is being rebuilt and took the report
    Absorbed,
    /// The rebuild finished and the unit is now resident; resubmit
    Created,
    /// No such unit anywhere
    NotFound,
}

/// Failover units being rebuilt from node reports
pub trait InBuildFailoverUnitCache: Send + Sync {
    /// Offer `report` from `from` for a unit that is not resident
    fn process_missing(&self, report: &ReplicaInfo, from: NodeInstance) -> Result<InBuildOutcome>;
}
