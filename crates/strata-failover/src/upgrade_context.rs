//! Background driver of the live fabric upgrade
//!
//! Each scan looks at the nodes of the current upgrade domain, asks the ones
//! that may go to upgrade, and feeds what it saw back into the
//! [`FabricUpgradeManager`]. The scan holds no lock across awaits; it works
//! on a snapshot of the live upgrade and the manager discards progress for a
//! snapshot that was superseded meanwhile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use strata_core::{NodeId, Result, SharedRuntime};

use crate::fabric_upgrade::{FabricUpgrade, UpgradeProgress};
use crate::health::{HealthReportFactory, HealthReporter};
use crate::messages::NodeFabricUpgradeRequest;
use crate::node_cache::{NodeCache, NodeInfo};
use crate::sender::NodeSender;
use crate::upgrade_manager::FabricUpgradeManager;

/// Replica set safety check run before a node is taken down
pub trait ReplicaSetSafetyCheck: Send + Sync {
    /// Whether every replica set on `node` tolerates losing it now
    fn is_safe_to_upgrade(&self, node: &NodeInfo) -> bool;
}

/// Accepts every node
pub struct NoSafetyCheck;

impl ReplicaSetSafetyCheck for NoSafetyCheck {
    fn is_safe_to_upgrade(&self, _node: &NodeInfo) -> bool {
        true
    }
}

/// Periodic fabric upgrade scan
pub struct FabricUpgradeContext {
    manager: Arc<FabricUpgradeManager>,
    nodes: Arc<dyn NodeCache>,
    sender: Arc<dyn NodeSender>,
    safety: Arc<dyn ReplicaSetSafetyCheck>,
    health: Arc<dyn HealthReporter>,
    factory: Arc<HealthReportFactory>,
    runtime: SharedRuntime,
    waiting_since: Mutex<HashMap<NodeId, (u64, Instant)>>,
}

impl FabricUpgradeContext {
    /// Scan over `manager`'s live upgrade
    pub fn new(
        manager: Arc<FabricUpgradeManager>,
        nodes: Arc<dyn NodeCache>,
        sender: Arc<dyn NodeSender>,
        safety: Arc<dyn ReplicaSetSafetyCheck>,
        health: Arc<dyn HealthReporter>,
        factory: Arc<HealthReportFactory>,
        runtime: SharedRuntime,
    ) -> Self {
        Self {
            manager,
            nodes,
            sender,
            safety,
            health,
            factory,
            runtime,
            waiting_since: Mutex::new(HashMap::new()),
        }
    }

    /// One scan; a no-op without a live upgrade
    pub async fn run_once(&self) -> Result<()> {
        self.manager.refresh_upgrade_domains();
        let Some(upgrade) = self.manager.upgrade() else {
            self.waiting_since.lock().clear();
            return Ok(());
        };

        let progress = match upgrade.current_domain() {
            Some(domain) if upgrade.can_start_current_domain() => {
                self.scan_domain(&upgrade, domain).await
            }
            Some(domain) => {
                tracing::debug!(
                    instance = upgrade.instance_id(),
                    domain = %domain,
                    "Upgrade domain waiting for verification"
                );
                UpgradeProgress::default()
            }
            None => UpgradeProgress::default(),
        };

        let complete = upgrade.current_domain().is_none()
            || (upgrade.can_start_current_domain() && progress.is_domain_done());
        let result = self
            .manager
            .update_fabric_upgrade_progress(&upgrade, progress, complete);

        if let Some(live) = self.manager.upgrade() {
            self.health
                .report(self.factory.fabric_upgrade_report(&live, self.runtime.now()));
        }
        result
    }

    async fn scan_domain(&self, upgrade: &FabricUpgrade, domain: &str) -> UpgradeProgress {
        let target = upgrade.target();
        let check_timeout = upgrade.description().upgrade_replica_set_check_timeout;
        let now = self.runtime.now();
        let mut progress = UpgradeProgress::default();
        let mut to_mark = Vec::new();

        for node in self.nodes.nodes().into_iter().filter(|n| n.upgrade_domain == domain) {
            let id = node.id();
            if !node.is_up || node.version_instance == target {
                self.waiting_since.lock().remove(&id);
                progress.ready.insert(id);
                continue;
            }

            if node.is_pending_fabric_upgrade {
                self.send_upgrade(&node, upgrade);
                progress.pending.insert(id);
                continue;
            }

            let waited = {
                let mut waiting = self.waiting_since.lock();
                let entry = waiting
                    .entry(id)
                    .or_insert((upgrade.instance_id(), now));
                if entry.0 != upgrade.instance_id() {
                    *entry = (upgrade.instance_id(), now);
                }
                now.saturating_duration_since(entry.1)
            };

            if !self.safety.is_safe_to_upgrade(&node) && waited < check_timeout {
                progress.waiting.insert(id);
                continue;
            }

            to_mark.push(node);
        }

        let marks = to_mark
            .iter()
            .map(|node| self.nodes.set_pending_fabric_upgrade(node, true));
        let results = join_all(marks).await;
        for (node, result) in to_mark.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.waiting_since.lock().remove(&node.id());
                    self.send_upgrade(node, upgrade);
                    progress.pending.insert(node.id());
                }
                Err(error) => {
                    tracing::info!(node = %node.instance, error = %error, "Marking node for upgrade failed");
                    progress.waiting.insert(node.id());
                }
            }
        }

        tracing::debug!(
            instance = upgrade.instance_id(),
            domain = %domain,
            ready = progress.ready.len(),
            pending = progress.pending.len(),
            waiting = progress.waiting.len(),
            "Upgrade domain scanned"
        );
        progress
    }

    fn send_upgrade(&self, node: &NodeInfo, upgrade: &FabricUpgrade) {
        self.sender.send_node_fabric_upgrade(
            node.instance,
            NodeFabricUpgradeRequest {
                specification: upgrade.description().specification.clone(),
            },
        );
    }
}
