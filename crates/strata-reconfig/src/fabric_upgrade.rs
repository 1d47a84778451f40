//! Node-side fabric upgrade strategy
//!
//! State graph:
//!
//! ```text
//! Download ──err──▶ DownloadFailed ──timer──▶ Download
//!    │ok
//!    ▼
//! Validate ──err──▶ ValidateFailed ──timer──▶ Validate
//!    │ok, restart needed            │ok, no restart
//!    ▼                              ▼
//! CloseReplicas ─────────────────▶ Upgrade ──err──▶ UpgradeFailed ──timer──▶ Upgrade
//!                                    │ok
//!                                    ▼
//!                                reply, Completed
//! ```
//!
//! Download and validation can be abandoned at any time. Closing replicas
//! defers a rollback until every replica is closed, and once the binaries are
//! being swapped nothing can interrupt the upgrade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use strata_core::{FabricUpgradeSpecification, StrataError, UpgradeType};

use crate::async_op::AsyncOperation;
use crate::hosting::NodeUpgradeContext;
use crate::state::{
    CancelBehaviorType, RollbackSnapshot, UpgradeStateDescription, UpgradeStateName,
};
use crate::state_machine::StateCompletion;
use crate::upgrade::Upgrade;

/// Drives this node to a new fabric version
pub struct FabricUpgrade {
    activity_id: String,
    specification: FabricUpgradeSpecification,
    context: NodeUpgradeContext,
    close_replicas_required: Arc<AtomicBool>,
    replicas_already_closed: AtomicBool,
}

impl FabricUpgrade {
    /// Strategy moving the node to `specification`
    pub fn new(
        activity_id: impl Into<String>,
        specification: FabricUpgradeSpecification,
        context: NodeUpgradeContext,
    ) -> Self {
        Self {
            activity_id: activity_id.into(),
            specification,
            context,
            close_replicas_required: Arc::new(AtomicBool::new(false)),
            replicas_already_closed: AtomicBool::new(false),
        }
    }

    /// Target of this upgrade
    pub fn specification(&self) -> &FabricUpgradeSpecification {
        &self.specification
    }

    fn next_after_validate(&self) -> UpgradeStateName {
        let required = self.close_replicas_required.load(Ordering::SeqCst);
        let closed = self.replicas_already_closed.load(Ordering::SeqCst);
        tracing::info!(
            activity_id = %self.activity_id,
            close_replicas_required = required,
            replicas_already_closed = closed,
            "Fabric upgrade validation decision"
        );
        if required && !closed {
            UpgradeStateName::FabricUpgradeCloseReplicas
        } else {
            UpgradeStateName::FabricUpgradeUpgrade
        }
    }

    fn unknown_state(&self, state: UpgradeStateName) -> UpgradeStateName {
        tracing::error!(
            activity_id = %self.activity_id,
            state = %state,
            "Fabric upgrade has no such state"
        );
        UpgradeStateName::Invalid
    }
}

impl Upgrade for FabricUpgrade {
    fn activity_id(&self) -> &str {
        &self.activity_id
    }

    fn instance_id(&self) -> u64 {
        self.specification.instance_id
    }

    fn get_start_state(&self, rollback: Option<&RollbackSnapshot>) -> UpgradeStateName {
        let closed = rollback
            .is_some_and(|snapshot| snapshot.state() == UpgradeStateName::FabricUpgradeCloseReplicas);
        self.replicas_already_closed.store(closed, Ordering::SeqCst);
        UpgradeStateName::FabricUpgradeDownload
    }

    fn state_description(&self, state: UpgradeStateName) -> UpgradeStateDescription {
        use CancelBehaviorType::*;
        use UpgradeStateName::*;
        let config = &self.context.config;
        match state {
            FabricUpgradeDownload => {
                UpgradeStateDescription::async_api(state, CancellableWithImmediateRollback)
            }
            FabricUpgradeDownloadFailed => UpgradeStateDescription::timer(
                state,
                config.fabric_upgrade_download_retry_interval(),
                FabricUpgradeDownload,
                CancellableWithImmediateRollback,
            ),
            FabricUpgradeValidate => {
                UpgradeStateDescription::async_api(state, CancellableWithImmediateRollback)
            }
            FabricUpgradeValidateFailed => UpgradeStateDescription::timer(
                state,
                config.fabric_upgrade_validate_retry_interval(),
                FabricUpgradeValidate,
                CancellableWithImmediateRollback,
            ),
            FabricUpgradeCloseReplicas => {
                UpgradeStateDescription::normal(state, NonCancellableWithDeferredRollback)
            }
            FabricUpgradeUpgrade => {
                UpgradeStateDescription::async_api(state, NonCancellableWithNoRollback)
            }
            FabricUpgradeUpgradeFailed => UpgradeStateDescription::timer(
                state,
                config.fabric_upgrade_upgrade_retry_interval(),
                FabricUpgradeUpgrade,
                NonCancellableWithNoRollback,
            ),
            other => UpgradeStateDescription::normal(other, NonCancellableWithNoRollback),
        }
    }

    fn enter_state(&self, state: UpgradeStateName, completion: StateCompletion) -> UpgradeStateName {
        match state {
            UpgradeStateName::FabricUpgradeCloseReplicas => {
                self.context.replicas.close_replicas(
                    &self.activity_id,
                    Box::new(move || completion.complete(UpgradeStateName::FabricUpgradeUpgrade)),
                );
                UpgradeStateName::Invalid
            }
            other => self.unknown_state(other),
        }
    }

    fn enter_async_operation_state(&self, state: UpgradeStateName, operation: AsyncOperation) {
        let hosting = Arc::clone(&self.context.hosting);
        let specification = self.specification.clone();
        let close_required = Arc::clone(&self.close_replicas_required);
        let task = async move {
            if operation.is_cancel_requested() {
                return;
            }
            let result = match state {
                UpgradeStateName::FabricUpgradeDownload => {
                    hosting.download_fabric(&specification).await
                }
                UpgradeStateName::FabricUpgradeValidate => hosting
                    .validate_fabric_upgrade(&specification)
                    .await
                    .map(|restart| {
                        let forced = specification.upgrade_type == UpgradeType::RollingForceRestart;
                        close_required.store(restart || forced, Ordering::SeqCst);
                    }),
                UpgradeStateName::FabricUpgradeUpgrade => hosting.fabric_upgrade(&specification).await,
                other => Err(StrataError::invalid(format!(
                    "fabric upgrade state {other} is not an async state"
                ))),
            };
            operation.complete(result);
        };
        self.context.runtime.spawn(task.boxed());
    }

    fn exit_async_operation_state(
        &self,
        state: UpgradeStateName,
        operation: &AsyncOperation,
    ) -> UpgradeStateName {
        use UpgradeStateName::*;
        let Some(outcome) = operation.outcome() else {
            tracing::error!(
                activity_id = %self.activity_id,
                state = %state,
                operation = operation.id(),
                "Async operation exited before resolving"
            );
            return Invalid;
        };
        if let Err(error) = outcome {
            tracing::warn!(
                activity_id = %self.activity_id,
                state = %state,
                error = %error,
                "Fabric upgrade step failed"
            );
            return match state {
                FabricUpgradeDownload => FabricUpgradeDownloadFailed,
                FabricUpgradeValidate => FabricUpgradeValidateFailed,
                FabricUpgradeUpgrade => FabricUpgradeUpgradeFailed,
                other => self.unknown_state(other),
            };
        }

        match state {
            FabricUpgradeDownload => FabricUpgradeValidate,
            FabricUpgradeValidate => self.next_after_validate(),
            FabricUpgradeUpgrade => {
                *self.context.node_version.write() = self.specification.version_instance();
                tracing::info!(
                    activity_id = %self.activity_id,
                    version = %self.specification.version_instance(),
                    "Fabric upgrade completed"
                );
                self.send_reply();
                Completed
            }
            other => self.unknown_state(other),
        }
    }

    fn create_rollback_snapshot(&self, state: UpgradeStateName) -> RollbackSnapshot {
        RollbackSnapshot::new(state)
    }

    fn send_reply(&self) {
        let version = self.context.node_version.read().clone();
        self.context.transport.send_node_fabric_upgrade_reply(version);
    }
}
