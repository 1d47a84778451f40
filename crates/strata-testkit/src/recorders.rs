//! Recording fakes for outbound signals and messages

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use strata_core::{FabricVersionInstance, NodeInstance, Result, StrataError};
use strata_failover::{
    HealthReport, HealthReporter, InBuildFailoverUnitCache, InBuildOutcome, NodeFabricUpgradeRequest,
    NodeInfo, NodeSender, PlacementSignal, ReplicaInfo, ReplicaSetSafetyCheck, ReplicaUpReply,
    ServiceInfo, ServiceLookup,
};
use strata_reconfig::FmTransport;

/// Records placement upgrade signals
#[derive(Default)]
pub struct RecordingPlacement {
    signals: Mutex<Vec<(bool, BTreeSet<String>)>>,
}

impl RecordingPlacement {
    /// Signals received, in order
    pub fn signals(&self) -> Vec<(bool, BTreeSet<String>)> {
        self.signals.lock().clone()
    }

    /// Last signal received
    pub fn last(&self) -> Option<(bool, BTreeSet<String>)> {
        self.signals.lock().last().cloned()
    }
}

impl PlacementSignal for RecordingPlacement {
    fn update_cluster_upgrade(&self, in_progress: bool, completed_domains: BTreeSet<String>) {
        self.signals.lock().push((in_progress, completed_domains));
    }
}

/// Records messages the failover manager sends to nodes
#[derive(Default)]
pub struct RecordingSender {
    upgrades: Mutex<Vec<(NodeInstance, NodeFabricUpgradeRequest)>>,
    replica_up_replies: Mutex<Vec<(NodeInstance, ReplicaUpReply)>>,
}

impl RecordingSender {
    /// Upgrade requests sent
    pub fn upgrade_requests(&self) -> Vec<(NodeInstance, NodeFabricUpgradeRequest)> {
        self.upgrades.lock().clone()
    }

    /// Replica up replies sent
    pub fn replica_up_replies(&self) -> Vec<(NodeInstance, ReplicaUpReply)> {
        self.replica_up_replies.lock().clone()
    }
}

impl NodeSender for RecordingSender {
    fn send_node_fabric_upgrade(&self, node: NodeInstance, request: NodeFabricUpgradeRequest) {
        self.upgrades.lock().push((node, request));
    }

    fn send_replica_up_reply(&self, node: NodeInstance, reply: ReplicaUpReply) {
        self.replica_up_replies.lock().push((node, reply));
    }
}

/// Records health reports
#[derive(Default)]
pub struct RecordingHealthReporter {
    reports: Mutex<Vec<HealthReport>>,
}

impl RecordingHealthReporter {
    /// Reports received, in order
    pub fn reports(&self) -> Vec<HealthReport> {
        self.reports.lock().clone()
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn report(&self, report: HealthReport) {
        self.reports.lock().push(report);
    }
}

/// Records replies a node sends to the failover manager
#[derive(Default)]
pub struct RecordingFmTransport {
    upgrade_replies: Mutex<Vec<FabricVersionInstance>>,
    cancel_replies: Mutex<Vec<FabricVersionInstance>>,
}

impl RecordingFmTransport {
    /// Upgrade replies sent
    pub fn upgrade_replies(&self) -> Vec<FabricVersionInstance> {
        self.upgrade_replies.lock().clone()
    }

    /// Cancel replies sent
    pub fn cancel_replies(&self) -> Vec<FabricVersionInstance> {
        self.cancel_replies.lock().clone()
    }
}

impl FmTransport for RecordingFmTransport {
    fn send_node_fabric_upgrade_reply(&self, version: FabricVersionInstance) {
        self.upgrade_replies.lock().push(version);
    }

    fn send_cancel_fabric_upgrade_reply(&self, version: FabricVersionInstance) {
        self.cancel_replies.lock().push(version);
    }
}

/// Service table
#[derive(Default)]
pub struct FakeServices {
    services: Mutex<HashMap<String, ServiceInfo>>,
}

impl FakeServices {
    /// Add or replace a service at `instance`
    pub fn insert(&self, name: &str, instance: u64) {
        self.services.lock().insert(
            name.to_string(),
            ServiceInfo {
                name: name.to_string(),
                instance,
                update_version: 0,
                is_to_be_deleted: false,
            },
        );
    }
}

impl ServiceLookup for FakeServices {
    fn get_service(&self, name: &str) -> Option<ServiceInfo> {
        self.services.lock().get(name).cloned()
    }

    fn update_service_version(&self, name: &str, instance: u64, update_version: u64) -> Result<()> {
        let mut services = self.services.lock();
        let service = services
            .get_mut(name)
            .ok_or_else(|| StrataError::service_not_found(name))?;
        if service.instance != instance {
            return Err(StrataError::stale(format!("service {name} instance {instance}")));
        }
        service.update_version = service.update_version.max(update_version);
        Ok(())
    }
}

/// In-build cache answering from a script, `NotFound` otherwise
#[derive(Default)]
pub struct FakeInBuild {
    outcomes: Mutex<HashMap<strata_core::FailoverUnitId, InBuildOutcome>>,
    offered: Mutex<Vec<ReplicaInfo>>,
}

impl FakeInBuild {
    /// Answer `outcome` for reports of `id`
    pub fn set(&self, id: strata_core::FailoverUnitId, outcome: InBuildOutcome) {
        self.outcomes.lock().insert(id, outcome);
    }

    /// Reports offered so far
    pub fn offered(&self) -> Vec<ReplicaInfo> {
        self.offered.lock().clone()
    }
}

impl InBuildFailoverUnitCache for FakeInBuild {
    fn process_missing(&self, report: &ReplicaInfo, _from: NodeInstance) -> Result<InBuildOutcome> {
        self.offered.lock().push(report.clone());
        Ok(self
            .outcomes
            .lock()
            .get(&report.failover_unit_id)
            .copied()
            .unwrap_or(InBuildOutcome::NotFound))
    }
}

/// Safety check with a configurable set of unsafe nodes
#[derive(Default)]
pub struct FakeSafetyCheck {
    unsafe_nodes: Mutex<BTreeSet<strata_core::NodeId>>,
}

impl FakeSafetyCheck {
    /// Hold `node` back until [`Self::release`]
    pub fn block(&self, node: strata_core::NodeId) {
        self.unsafe_nodes.lock().insert(node);
    }

    /// Let `node` go
    pub fn release(&self, node: strata_core::NodeId) {
        self.unsafe_nodes.lock().remove(&node);
    }
}

impl ReplicaSetSafetyCheck for FakeSafetyCheck {
    fn is_safe_to_upgrade(&self, node: &NodeInfo) -> bool {
        !self.unsafe_nodes.lock().contains(&node.id())
    }
}
