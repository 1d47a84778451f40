//! Failover manager facade
//!
//! Wires the upgrade manager, the background scan, replica reconciliation
//! and health reporting to the messages the failover manager receives.

use std::sync::Arc;

use strata_core::{
    ErrorCodeValue, FabricVersionInstance, FailoverConfig, NodeId, NodeInstance, Result,
    SharedRuntime, TaskRegistry,
};

use crate::fabric_upgrade::FabricUpgrade;
use crate::failover_unit_cache::FailoverUnitCache;
use crate::health::{FailoverUnitHealthTracker, HealthReportFactory, HealthReporter};
use crate::messages::{
    CancelFabricUpgradeReply, NodeFabricUpgradeReply, NodeUpMessage, NodeUpReply, ReplicaUpMessage,
    UpgradeFabricReply, UpgradeFabricRequest,
};
use crate::node_cache::{DeactivationIntent, NodeCache, NodeInfo};
use crate::placement::PlacementSignal;
use crate::replica_update::{ReplicaUpProcessingOperation, ReplicaUpdateContext, ReplicasUpdateOperation};
use crate::sender::NodeSender;
use crate::service::{InBuildFailoverUnitCache, ServiceLookup};
use crate::store::FailoverStore;
use crate::upgrade_context::{FabricUpgradeContext, ReplicaSetSafetyCheck};
use crate::upgrade_manager::{FabricUpgradeManager, UpgradeManagerContext};

/// Everything the failover manager talks to
#[derive(Clone)]
pub struct FailoverManagerDependencies {
    /// Pool, timers and clock
    pub runtime: SharedRuntime,
    /// Persistence
    pub store: Arc<dyn FailoverStore>,
    /// Node records
    pub nodes: Arc<dyn NodeCache>,
    /// Resident failover units
    pub failover_units: Arc<FailoverUnitCache>,
    /// Service descriptions
    pub services: Arc<dyn ServiceLookup>,
    /// Units being rebuilt
    pub in_build: Arc<dyn InBuildFailoverUnitCache>,
    /// Outbound node messages
    pub sender: Arc<dyn NodeSender>,
    /// Upgrade status for placement
    pub placement: Arc<dyn PlacementSignal>,
    /// Health sink
    pub health: Arc<dyn HealthReporter>,
    /// Replica set safety checks
    pub safety: Arc<dyn ReplicaSetSafetyCheck>,
}

/// Failover manager message handlers and background work
pub struct FailoverManager {
    config: FailoverConfig,
    deps: FailoverManagerDependencies,
    upgrades: Arc<FabricUpgradeManager>,
    upgrade_context: FabricUpgradeContext,
    factory: Arc<HealthReportFactory>,
    unit_health: FailoverUnitHealthTracker,
}

impl FailoverManager {
    /// Failover manager at `current`, resuming `upgrade` if one was persisted
    pub fn new(
        config: FailoverConfig,
        deps: FailoverManagerDependencies,
        current: FabricVersionInstance,
        upgrade: Option<FabricUpgrade>,
    ) -> Arc<Self> {
        let upgrades = Arc::new(FabricUpgradeManager::load(
            UpgradeManagerContext {
                store: Arc::clone(&deps.store),
                placement: Arc::clone(&deps.placement),
                nodes: Arc::clone(&deps.nodes),
                runtime: Arc::clone(&deps.runtime),
                config: config.clone(),
            },
            current,
            upgrade,
        ));
        let factory = Arc::new(HealthReportFactory::new(config.clone()));
        let upgrade_context = FabricUpgradeContext::new(
            Arc::clone(&upgrades),
            Arc::clone(&deps.nodes),
            Arc::clone(&deps.sender),
            Arc::clone(&deps.safety),
            Arc::clone(&deps.health),
            Arc::clone(&factory),
            Arc::clone(&deps.runtime),
        );
        Arc::new(Self {
            config,
            deps,
            upgrades,
            upgrade_context,
            factory,
            unit_health: FailoverUnitHealthTracker::new(),
        })
    }

    /// Cluster upgrade bookkeeping
    pub fn upgrade_manager(&self) -> &Arc<FabricUpgradeManager> {
        &self.upgrades
    }

    // =========================================================================
    // Message handlers
    // =========================================================================

    /// Cluster manager upgrade request; errors become the reply code
    pub fn process_upgrade_fabric_request(&self, request: &UpgradeFabricRequest) -> UpgradeFabricReply {
        match self.upgrades.process_fabric_upgrade(request) {
            Ok(reply) => reply,
            Err(error) => UpgradeFabricReply {
                error: error.code(),
                completed_upgrade_domains: self.upgrades.completed_upgrade_domains(),
            },
        }
    }

    /// Node finished (or reports) an upgrade
    pub async fn process_node_fabric_upgrade_reply(
        &self,
        reply: &NodeFabricUpgradeReply,
        from: NodeInstance,
    ) {
        if let Err(error) = self.upgrades.process_node_fabric_upgrade_reply(reply, from).await {
            tracing::info!(from = %from, error = %error, "Node upgrade reply not recorded");
        }
    }

    /// Node dropped a cancelled upgrade
    pub async fn process_cancel_fabric_upgrade_reply(
        &self,
        reply: &CancelFabricUpgradeReply,
        from: NodeInstance,
    ) {
        if let Err(error) = self.upgrades.process_cancel_fabric_upgrade_reply(reply, from).await {
            tracing::info!(from = %from, error = %error, "Cancel upgrade reply not recorded");
        }
    }

    /// Replica up batch; the reply is sent when the returned batch completes
    pub fn process_replica_up(
        &self,
        from: NodeInstance,
        message: ReplicaUpMessage,
    ) -> Arc<ReplicasUpdateOperation> {
        let context = ReplicaUpdateContext {
            cache: Arc::clone(&self.deps.failover_units),
            services: Arc::clone(&self.deps.services),
            in_build: Arc::clone(&self.deps.in_build),
            runtime: Arc::clone(&self.deps.runtime),
            config: self.config.clone(),
        };
        ReplicaUpProcessingOperation::start(
            from,
            message,
            context,
            Arc::clone(&self.deps.nodes),
            Arc::clone(&self.deps.sender),
        )
    }

    /// Node joining; rejected while it runs a version it must not run
    pub fn process_node_up(&self, message: &NodeUpMessage) -> NodeUpReply {
        let (needed, target) = self
            .upgrades
            .is_fabric_upgrade_needed(&message.version_instance, &message.upgrade_domain);

        if needed && self.config.fabric_upgrade_gatekeeping_enabled {
            tracing::info!(
                node = %message.node,
                version = %message.version_instance,
                target_version = %target,
                "Node up rejected until it upgrades"
            );
            return NodeUpReply {
                error: ErrorCodeValue::InvalidRolloutVersion,
                target_version_instance: target,
            };
        }

        let node = NodeInfo::up(
            message.node,
            message.upgrade_domain.clone(),
            message.version_instance.clone(),
        );
        let error = match self.deps.nodes.node_up(node.clone()) {
            Ok(()) => {
                let is_upgrade = self.upgrades.is_upgrade_in_progress();
                self.deps
                    .health
                    .report(self.factory.node_info_report(&node, false, is_upgrade));
                ErrorCodeValue::Success
            }
            Err(error) => error.code(),
        };
        NodeUpReply {
            error,
            target_version_instance: target,
        }
    }

    /// Node went down
    ///
    /// A node that was being deactivated has finished its deactivation.
    pub fn process_node_down(&self, node: NodeInstance) -> Result<()> {
        self.deps.nodes.node_down(node)?;
        if let Some(info) = self.deps.nodes.get_node(node.id) {
            let is_upgrade = info.is_pending_fabric_upgrade;
            self.deps
                .health
                .report(self.factory.node_info_report(&info, false, is_upgrade));
            if info.deactivation.is_some() {
                self.deps
                    .health
                    .report(self.factory.node_deactivation_report(&info, false, true));
            }
        }
        Ok(())
    }

    /// Deactivation requested for a node
    pub fn process_node_deactivate(&self, id: NodeId, intent: DeactivationIntent) -> Result<()> {
        self.deps.nodes.deactivate_node(id, intent)?;
        if let Some(info) = self.deps.nodes.get_node(id) {
            self.deps
                .health
                .report(self.factory.node_deactivation_report(&info, false, !info.is_up));
        }
        Ok(())
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// One pass of the upgrade scan and failover unit health checks
    pub async fn run_background_scan(&self) -> Result<()> {
        let result = self.upgrade_context.run_once().await;

        let now = self.deps.runtime.now();
        for unit in self.deps.failover_units.snapshot() {
            if let Some(report) = self.unit_health.update(&self.factory, &unit, now, &self.config) {
                self.deps.health.report(report);
            }
        }
        result
    }

    /// Run [`Self::run_background_scan`] every scan interval until shutdown
    pub fn start_background(self: &Arc<Self>, tasks: &TaskRegistry) {
        let interval = self.config.periodic_state_scan_interval();
        let manager = Arc::clone(self);
        tasks.spawn_interval_until(interval, move || {
            let manager = Arc::clone(&manager);
            async move {
                if let Err(error) = manager.run_background_scan().await {
                    tracing::info!(error = %error, "Background scan failed");
                }
                true
            }
        });
        tracing::info!(interval_ms = interval.as_millis() as u64, "Failover manager background scan started");
    }
}
