//! Health reports emitted by the failover manager
//!
//! [`HealthReportFactory`] turns node, failover unit and upgrade state into
//! [`HealthReport`]s. Reports are only built here; delivery is the
//! [`HealthReporter`] sink's concern.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_core::{FailoverConfig, FailoverUnitId, NodeId};

use crate::fabric_upgrade::FabricUpgrade;
use crate::failover_unit::{FailoverUnit, FailoverUnitHealthState};
use crate::node_cache::{DeactivationIntent, NodeInfo};

/// Source id stamped on every report
pub const HEALTH_SOURCE_ID: &str = "System.FM";

/// Reported health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthState {
    /// Nothing to report
    Ok,
    /// Degraded but serving
    Warning,
    /// Needs attention
    Error,
}

/// Entity a report is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthEntity {
    /// A node
    Node(NodeId),
    /// A partition
    Partition(FailoverUnitId),
    /// The whole cluster
    Cluster,
}

/// One health report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Subject
    pub entity: HealthEntity,
    /// Reporting component
    pub source_id: String,
    /// Aspect of the entity being reported
    pub property: String,
    /// Health
    pub state: HealthState,
    /// Human readable detail
    pub description: String,
    /// Orders reports from the same source
    pub sequence_number: u64,
    /// Entity attributes
    pub attributes: BTreeMap<String, String>,
}

/// Destination of health reports
pub trait HealthReporter: Send + Sync {
    /// Deliver `report`; never blocks
    fn report(&self, report: HealthReport);
}

/// Builds reports with increasing sequence numbers
pub struct HealthReportFactory {
    config: FailoverConfig,
    sequence: AtomicU64,
}

impl HealthReportFactory {
    /// Factory reading thresholds from `config`
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(1),
        }
    }

    fn build(
        &self,
        entity: HealthEntity,
        property: &str,
        state: HealthState,
        description: String,
        attributes: BTreeMap<String, String>,
    ) -> HealthReport {
        HealthReport {
            entity,
            source_id: HEALTH_SOURCE_ID.to_string(),
            property: property.to_string(),
            state,
            description,
            sequence_number: self.sequence.fetch_add(1, Ordering::Relaxed),
            attributes,
        }
    }

    /// Node up or down
    ///
    /// A node that is down because of an upgrade or a planned deactivation is
    /// a warning; any other down node is an error.
    pub fn node_info_report(&self, node: &NodeInfo, is_seed: bool, is_upgrade: bool) -> HealthReport {
        let (state, description) = if node.is_up {
            (HealthState::Ok, "Node is up".to_string())
        } else if is_upgrade {
            (HealthState::Warning, "Node is down for upgrade".to_string())
        } else if node.deactivation.is_some() {
            (HealthState::Warning, "Node is down and deactivated".to_string())
        } else {
            (HealthState::Error, "Node is down".to_string())
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("UpgradeDomain".to_string(), node.upgrade_domain.clone());
        attributes.insert("IsSeedNode".to_string(), is_seed.to_string());
        attributes.insert("FabricVersion".to_string(), node.version_instance.to_string());
        attributes.insert("InstanceId".to_string(), node.instance.instance_id.to_string());
        self.build(HealthEntity::Node(node.id()), "State", state, description, attributes)
    }

    /// Progress of a node deactivation
    pub fn node_deactivation_report(
        &self,
        node: &NodeInfo,
        is_seed: bool,
        is_deactivation_complete: bool,
    ) -> HealthReport {
        let intent = node.deactivation;
        let removes = matches!(
            intent,
            Some(DeactivationIntent::RemoveData | DeactivationIntent::RemoveNode)
        );
        let (state, description) = if is_seed && removes {
            (
                HealthState::Warning,
                format!("Seed node deactivation {intent:?} cannot complete"),
            )
        } else if is_deactivation_complete {
            (HealthState::Ok, format!("Deactivation {intent:?} complete"))
        } else {
            (HealthState::Ok, format!("Deactivation {intent:?} in progress"))
        };
        self.build(
            HealthEntity::Node(node.id()),
            "Deactivation",
            state,
            description,
            BTreeMap::new(),
        )
    }

    /// Partition health for a classified failover unit
    pub fn failover_unit_report(
        &self,
        unit: &FailoverUnit,
        state: FailoverUnitHealthState,
        description: String,
    ) -> HealthReport {
        use FailoverUnitHealthState::*;
        let health = match state {
            QuorumLost => HealthState::Error,
            ReconfigurationStuck
            | PlacementStuck
            | PlacementStuckBelowMinReplicaCount
            | PlacementStuckAtZeroReplicaCount => HealthState::Warning,
            Healthy | Placement | Build | Reconfiguration | DeletionInProgress => HealthState::Ok,
        };
        let description = if description.is_empty() {
            format!("{state:?}")
        } else {
            format!("{state:?}\n{description}")
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("ServiceName".to_string(), unit.service_name.clone());
        self.build(HealthEntity::Partition(unit.id), "State", health, description, attributes)
    }

    /// Cluster upgrade progress; a domain running past its expected time warns
    pub fn fabric_upgrade_report(&self, upgrade: &FabricUpgrade, now: Instant) -> HealthReport {
        let elapsed = now.saturating_duration_since(upgrade.domain_started_at());
        let domain = upgrade.current_domain().unwrap_or_default().to_string();
        let progress = upgrade.progress();
        let slow = !domain.is_empty() && elapsed > self.config.expected_node_fabric_upgrade_duration();

        let (state, description) = if slow {
            (
                HealthState::Warning,
                format!(
                    "Upgrade domain {domain} has been upgrading for {}s; pending {:?}, waiting {:?}",
                    elapsed.as_secs(),
                    progress.pending,
                    progress.waiting
                ),
            )
        } else {
            (
                HealthState::Ok,
                format!("Upgrading to {} in domain {domain}", upgrade.target()),
            )
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("TargetVersion".to_string(), upgrade.target().to_string());
        attributes.insert("CurrentUpgradeDomain".to_string(), domain);
        attributes.insert(
            "CompletedUpgradeDomains".to_string(),
            upgrade.completed_domains_in_order().join(","),
        );
        self.build(HealthEntity::Cluster, "FabricUpgrade", state, description, attributes)
    }
}

/// Remembers the last reported state per failover unit
///
/// Progress states collapse into healthy, so a unit moving between placement
/// and build does not produce a report.
#[derive(Default)]
pub struct FailoverUnitHealthTracker {
    last: Mutex<HashMap<FailoverUnitId, (FailoverUnitHealthState, String)>>,
}

impl FailoverUnitHealthTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `unit`; returns a report when its effective health changed
    pub fn update(
        &self,
        factory: &HealthReportFactory,
        unit: &FailoverUnit,
        now: Instant,
        config: &FailoverConfig,
    ) -> Option<HealthReport> {
        let (state, description) = unit.current_health(now, config);
        let effective = state.effective();
        let mut last = self.last.lock();
        if let Some((previous, previous_description)) = last.get(&unit.id) {
            if *previous == effective && *previous_description == description {
                return None;
            }
        }
        last.insert(unit.id, (effective, description.clone()));
        Some(factory.failover_unit_report(unit, effective, description))
    }

    /// Forget a unit that left the cache
    pub fn remove(&self, id: FailoverUnitId) {
        self.last.lock().remove(&id);
    }
}
