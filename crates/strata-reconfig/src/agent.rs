//! Node fabric upgrade agent
//!
//! Entry point for the two fabric upgrade messages a node receives from the
//! failover manager. Stale and duplicate messages are answered with the
//! node's version; anything newer becomes a [`FabricUpgrade`] state machine.

use std::sync::Arc;

use strata_core::{FabricUpgradeSpecification, FabricVersionInstance};

use crate::fabric_upgrade::FabricUpgrade;
use crate::hosting::NodeUpgradeContext;
use crate::message_processor::UpgradeMessageProcessor;
use crate::staleness::{
    check_fabric_upgrade_at_upgrade_message, is_cancel_relevant, FabricUpgradeStalenessCheckResult,
};
use crate::state::UpgradeCancelResult;
use crate::state_machine::UpgradeStateMachine;

const FABRIC_UPGRADE_KEY: &str = "fabric";

/// Applies fabric upgrades on one node
pub struct FabricUpgradeAgent {
    context: NodeUpgradeContext,
    processor: Arc<UpgradeMessageProcessor>,
}

impl FabricUpgradeAgent {
    /// Agent for a node running `context.node_version`
    pub fn new(context: NodeUpgradeContext) -> Self {
        Self {
            context,
            processor: UpgradeMessageProcessor::new(),
        }
    }

    /// Version the node runs
    pub fn node_version(&self) -> FabricVersionInstance {
        self.context.node_version.read().clone()
    }

    /// Whether a fabric upgrade is in flight
    pub fn is_upgrading(&self) -> bool {
        self.processor.is_upgrading(FABRIC_UPGRADE_KEY)
    }

    /// Machine running the fabric upgrade, if any
    pub fn current_upgrade(&self) -> Option<Arc<UpgradeStateMachine>> {
        self.processor.current(FABRIC_UPGRADE_KEY)
    }

    /// Handle a node fabric upgrade request
    ///
    /// Returns true when a state machine took the request.
    pub fn process_node_fabric_upgrade(
        &self,
        activity_id: &str,
        specification: FabricUpgradeSpecification,
    ) -> bool {
        let node_version = self.node_version();
        match check_fabric_upgrade_at_upgrade_message(&node_version, &specification) {
            FabricUpgradeStalenessCheckResult::UpgradeNotRequired => {
                tracing::debug!(
                    activity_id,
                    node = %node_version,
                    incoming = %specification.version_instance(),
                    "Fabric upgrade not required"
                );
                self.context
                    .transport
                    .send_node_fabric_upgrade_reply(node_version);
                false
            }
            FabricUpgradeStalenessCheckResult::Assert => {
                tracing::error!(
                    activity_id,
                    node = %node_version,
                    incoming = %specification.version_instance(),
                    "Fabric upgrade instance reused for a different version"
                );
                false
            }
            FabricUpgradeStalenessCheckResult::UpgradeRequired => {
                let upgrade = FabricUpgrade::new(activity_id, specification, self.context.clone());
                let machine =
                    UpgradeStateMachine::create(Box::new(upgrade), Arc::clone(&self.context.runtime));
                self.processor
                    .process_upgrade_message(FABRIC_UPGRADE_KEY, machine)
            }
        }
    }

    /// Handle a cancel fabric upgrade request
    pub fn process_cancel_fabric_upgrade(
        &self,
        activity_id: &str,
        specification: &FabricUpgradeSpecification,
    ) -> UpgradeCancelResult {
        let node_version = self.node_version();
        if !is_cancel_relevant(&node_version, specification) {
            tracing::debug!(
                activity_id,
                node = %node_version,
                "Cancel fabric upgrade for an applied version"
            );
            self.context
                .transport
                .send_cancel_fabric_upgrade_reply(node_version);
            return UpgradeCancelResult::Success;
        }

        let transport = Arc::clone(&self.context.transport);
        let version = Arc::clone(&self.context.node_version);
        let result = self.processor.process_cancel_upgrade_message(
            FABRIC_UPGRADE_KEY,
            specification.instance_id,
            move || transport.send_cancel_fabric_upgrade_reply(version.read().clone()),
        );
        tracing::info!(activity_id, ?result, "Cancel fabric upgrade processed");
        result
    }

    /// Stop every upgrade and refuse further messages
    pub fn close(&self) {
        self.processor.close();
    }
}
