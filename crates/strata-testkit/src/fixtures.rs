//! Builders for common values and fully wired harnesses

use std::sync::Arc;

use parking_lot::RwLock;
use strata_core::{
    FabricUpgradeSpecification, FabricVersion, FabricVersionInstance, FailoverConfig,
    FailoverUnitId, NodeId, NodeInstance, ReconfigurationConfig, Result,
};
use strata_failover::{
    FabricUpgrade, FailoverManager, FailoverManagerDependencies, FailoverUnitCache, MemoryNodeCache,
    NodeFabricUpgradeReply, NodeInfo, ReplicaInfo, UpgradeFabricRequest,
};
use strata_reconfig::{FabricUpgradeAgent, NodeUpgradeContext, SharedNodeVersion};

use crate::hosting::{FakeHosting, FakeReplicaCloser};
use crate::recorders::{
    FakeInBuild, FakeSafetyCheck, FakeServices, RecordingFmTransport, RecordingHealthReporter,
    RecordingPlacement, RecordingSender,
};
use crate::runtime::ManualRuntime;
use crate::store::MemoryStore;

// =============================================================================
// Values
// =============================================================================

/// Version `code` at upgrade attempt `instance`
pub fn version(code: &str, instance: u64) -> FabricVersionInstance {
    FabricVersionInstance::new(FabricVersion::new(code, "cfg"), instance)
}

/// Rolling specification for `code` at attempt `instance`
pub fn spec(code: &str, instance: u64) -> FabricUpgradeSpecification {
    FabricUpgradeSpecification::rolling(FabricVersion::new(code, "cfg"), instance)
}

/// Upgrade request for `code` at attempt `instance`
pub fn request(code: &str, instance: u64) -> UpgradeFabricRequest {
    UpgradeFabricRequest::new(spec(code, instance))
}

/// Incarnation `instance` of node `id`
pub fn node_instance(id: u128, instance: u64) -> NodeInstance {
    NodeInstance::new(NodeId::new(id), instance)
}

/// Up node record
pub fn node(id: u128, domain: &str, running: FabricVersionInstance) -> NodeInfo {
    NodeInfo::up(node_instance(id, 1), domain, running)
}

/// Report for replica `replica_id` of `unit` hosted on `host`
pub fn replica(unit: FailoverUnitId, service: &str, host: NodeInstance, replica_id: u64) -> ReplicaInfo {
    ReplicaInfo {
        failover_unit_id: unit,
        service_name: service.to_string(),
        service_instance: 1,
        service_update_version: 0,
        node: host,
        replica_id,
        is_up: true,
        is_dropped: false,
    }
}

// =============================================================================
// Failover manager
// =============================================================================

/// Failover manager wired to in-memory fakes and a manual runtime
pub struct FmHarness {
    /// Drives posts, timers and futures
    pub runtime: Arc<ManualRuntime>,
    /// Store
    pub store: Arc<MemoryStore>,
    /// Node records
    pub nodes: Arc<MemoryNodeCache>,
    /// Resident failover units
    pub failover_units: Arc<FailoverUnitCache>,
    /// Service table
    pub services: Arc<FakeServices>,
    /// In-build units
    pub in_build: Arc<FakeInBuild>,
    /// Outbound node messages
    pub sender: Arc<RecordingSender>,
    /// Placement signals
    pub placement: Arc<RecordingPlacement>,
    /// Health reports
    pub health: Arc<RecordingHealthReporter>,
    /// Safety check
    pub safety: Arc<FakeSafetyCheck>,
    /// Failover manager under test
    pub fm: Arc<FailoverManager>,
}

impl FmHarness {
    /// Cluster at `current` with `nodes` and no live upgrade
    pub fn new(
        config: FailoverConfig,
        current: FabricVersionInstance,
        nodes: impl IntoIterator<Item = NodeInfo>,
    ) -> Self {
        Self::resume(config, current, nodes, None)
    }

    /// Cluster at `current` resuming a persisted `upgrade`
    pub fn resume(
        config: FailoverConfig,
        current: FabricVersionInstance,
        nodes: impl IntoIterator<Item = NodeInfo>,
        upgrade: Option<FabricUpgrade>,
    ) -> Self {
        let runtime = ManualRuntime::new();
        let store = Arc::new(MemoryStore::new());
        let node_cache = Arc::new(MemoryNodeCache::with_nodes(store.clone(), nodes));
        let failover_units = FailoverUnitCache::new(runtime.shared(), store.clone());
        let services = Arc::new(FakeServices::default());
        let in_build = Arc::new(FakeInBuild::default());
        let sender = Arc::new(RecordingSender::default());
        let placement = Arc::new(RecordingPlacement::default());
        let health = Arc::new(RecordingHealthReporter::default());
        let safety = Arc::new(FakeSafetyCheck::default());

        let deps = FailoverManagerDependencies {
            runtime: runtime.shared(),
            store: store.clone(),
            nodes: node_cache.clone(),
            failover_units: Arc::clone(&failover_units),
            services: services.clone(),
            in_build: in_build.clone(),
            sender: sender.clone(),
            placement: placement.clone(),
            health: health.clone(),
            safety: safety.clone(),
        };
        let fm = FailoverManager::new(config, deps, current, upgrade);

        Self {
            runtime,
            store,
            nodes: node_cache,
            failover_units,
            services,
            in_build,
            sender,
            placement,
            health,
            safety,
            fm,
        }
    }

    /// One background scan, driven to completion
    pub fn scan(&self) -> Result<()> {
        self.runtime.block_on(self.fm.run_background_scan())
    }

    /// Deliver a node's upgrade reply
    pub fn node_reached(&self, from: NodeInstance, reached: FabricVersionInstance) {
        let reply = NodeFabricUpgradeReply {
            version_instance: reached,
        };
        self.runtime
            .block_on(self.fm.process_node_fabric_upgrade_reply(&reply, from));
    }
}

// =============================================================================
// Reconfiguration agent
// =============================================================================

/// Fabric upgrade agent wired to fakes and a manual runtime
pub struct RaHarness {
    /// Drives timers and hosting futures
    pub runtime: Arc<ManualRuntime>,
    /// Hosting calls
    pub hosting: Arc<FakeHosting>,
    /// Replica closing
    pub replicas: Arc<FakeReplicaCloser>,
    /// Replies to the failover manager
    pub transport: Arc<RecordingFmTransport>,
    /// Version the node runs
    pub node_version: SharedNodeVersion,
    /// Agent under test
    pub agent: FabricUpgradeAgent,
}

impl RaHarness {
    /// Node running `running` with default retry intervals
    pub fn new(running: FabricVersionInstance) -> Self {
        Self::with_config(running, ReconfigurationConfig::default())
    }

    /// Node running `running` with `config`
    pub fn with_config(running: FabricVersionInstance, config: ReconfigurationConfig) -> Self {
        let runtime = ManualRuntime::new();
        let hosting = Arc::new(FakeHosting::default());
        let replicas = Arc::new(FakeReplicaCloser::default());
        let transport = Arc::new(RecordingFmTransport::default());
        let node_version: SharedNodeVersion = Arc::new(RwLock::new(running));
        let context = NodeUpgradeContext {
            hosting: hosting.clone(),
            replicas: replicas.clone(),
            transport: transport.clone(),
            runtime: runtime.shared(),
            node_version: Arc::clone(&node_version),
            config,
        };
        let agent = FabricUpgradeAgent::new(context);
        Self {
            runtime,
            hosting,
            replicas,
            transport,
            node_version,
            agent,
        }
    }

    /// Version the node runs now
    pub fn running(&self) -> FabricVersionInstance {
        self.node_version.read().clone()
    }
}
