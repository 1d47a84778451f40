//! Upgrade state vocabulary
//!
//! A strategy describes its state graph with [`UpgradeStateDescription`]s:
//! what kind of work a state performs and how it reacts to cancellation. The
//! state machine consults nothing else when deciding how to drive a state or
//! whether a cancel request may interrupt it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of an upgrade state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeStateName {
    /// Not started
    None,
    /// Sentinel: the caller must not continue driving on this thread
    Invalid,
    /// Terminal state
    Completed,

    /// Download the fabric package
    FabricUpgradeDownload,
    /// Wait before retrying the download
    FabricUpgradeDownloadFailed,
    /// Ask hosting whether the upgrade requires replicas to restart
    FabricUpgradeValidate,
    /// Wait before retrying validation
    FabricUpgradeValidateFailed,
    /// Close local replicas ahead of a restart
    FabricUpgradeCloseReplicas,
    /// Apply the new version
    FabricUpgradeUpgrade,
    /// Wait before retrying the upgrade
    FabricUpgradeUpgradeFailed,

    /// General purpose state for strategies without a dedicated graph
    Stage1,
    /// General purpose state for strategies without a dedicated graph
    Stage2,
}

impl UpgradeStateName {
    /// Whether this is a state a strategy may start in
    pub fn is_startable(self) -> bool {
        !matches!(self, Self::None | Self::Invalid | Self::Completed)
    }
}

impl fmt::Display for UpgradeStateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a state reacts to cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelBehaviorType {
    /// Both cancel and rollback interrupt the state right away
    CancellableWithImmediateRollback,
    /// Cancel is refused; rollback waits until the state finishes
    NonCancellableWithDeferredRollback,
    /// Cancel is refused; rollback interrupts the state right away
    NonCancellableWithImmediateRollback,
    /// Neither cancel nor rollback is accepted
    NonCancellableWithNoRollback,
}

/// What kind of work a state performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStateKind {
    /// Synchronous work, possibly finishing through a continuation
    Normal,
    /// Driven by an asynchronous operation
    AsyncApi,
    /// No work: wait `retry_interval` then move to `target`
    Timer {
        /// Delay before moving on
        retry_interval: Duration,
        /// State entered when the timer fires
        target: UpgradeStateName,
    },
}

/// Static description of one state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeStateDescription {
    /// State being described
    pub name: UpgradeStateName,
    /// How the state is driven
    pub kind: UpgradeStateKind,
    /// How the state reacts to cancellation
    pub cancel_behavior: CancelBehaviorType,
}

impl UpgradeStateDescription {
    /// Synchronous state
    pub fn normal(name: UpgradeStateName, cancel_behavior: CancelBehaviorType) -> Self {
        Self {
            name,
            kind: UpgradeStateKind::Normal,
            cancel_behavior,
        }
    }

    /// Async API state
    pub fn async_api(name: UpgradeStateName, cancel_behavior: CancelBehaviorType) -> Self {
        Self {
            name,
            kind: UpgradeStateKind::AsyncApi,
            cancel_behavior,
        }
    }

    /// Timer state
    pub fn timer(
        name: UpgradeStateName,
        retry_interval: Duration,
        target: UpgradeStateName,
        cancel_behavior: CancelBehaviorType,
    ) -> Self {
        Self {
            name,
            kind: UpgradeStateKind::Timer {
                retry_interval,
                target,
            },
            cancel_behavior,
        }
    }
}

/// What the caller of a cancel wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeCancelMode {
    /// Abandon the upgrade without rolling back
    Cancel,
    /// Stop so a rollback state machine can take over
    Rollback,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeCancelResult {
    /// The machine is closed
    Success,
    /// The machine closes when the current state finishes
    Queued,
    /// The current state refuses this mode
    NotAllowed,
}

/// Life cycle of an upgrade state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifeCycleState {
    /// Driving states
    Open,
    /// A deferred rollback waits for the current state to finish
    Cancelling,
    /// No further transitions
    Closed,
}

/// How a cancel request is applied to the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// Stop the timer or async operation and close now
    Immediate,
    /// Close once the current state finishes
    Deferred,
    /// Refuse
    NotAllowed,
}

/// Cancel action for `mode` against a state with `behavior`
pub fn decide_cancel_action(mode: UpgradeCancelMode, behavior: CancelBehaviorType) -> CancelAction {
    use self::CancelBehaviorType::*;
    match (mode, behavior) {
        (_, CancellableWithImmediateRollback) => CancelAction::Immediate,
        (UpgradeCancelMode::Cancel, _) => CancelAction::NotAllowed,
        (UpgradeCancelMode::Rollback, NonCancellableWithDeferredRollback) => CancelAction::Deferred,
        (UpgradeCancelMode::Rollback, NonCancellableWithImmediateRollback) => {
            CancelAction::Immediate
        }
        (UpgradeCancelMode::Rollback, NonCancellableWithNoRollback) => CancelAction::NotAllowed,
    }
}

/// Where a closed machine stopped, handed to the next machine for the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    state: UpgradeStateName,
}

impl RollbackSnapshot {
    /// Snapshot of `state`
    pub fn new(state: UpgradeStateName) -> Self {
        Self { state }
    }

    /// State the previous machine stopped in
    pub fn state(&self) -> UpgradeStateName {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::CancelBehaviorType::*;

    #[test]
    fn cancel_requires_cancellable_state() {
        let mode = UpgradeCancelMode::Cancel;
        assert_eq!(
            decide_cancel_action(mode, CancellableWithImmediateRollback),
            CancelAction::Immediate
        );
        for behavior in [
            NonCancellableWithDeferredRollback,
            NonCancellableWithImmediateRollback,
            NonCancellableWithNoRollback,
        ] {
            assert_eq!(decide_cancel_action(mode, behavior), CancelAction::NotAllowed);
        }
    }

    #[test]
    fn rollback_refused_only_without_rollback() {
        let mode = UpgradeCancelMode::Rollback;
        assert_eq!(
            decide_cancel_action(mode, CancellableWithImmediateRollback),
            CancelAction::Immediate
        );
        assert_eq!(
            decide_cancel_action(mode, NonCancellableWithDeferredRollback),
            CancelAction::Deferred
        );
        assert_eq!(
            decide_cancel_action(mode, NonCancellableWithImmediateRollback),
            CancelAction::Immediate
        );
        assert_eq!(
            decide_cancel_action(mode, NonCancellableWithNoRollback),
            CancelAction::NotAllowed
        );
    }

    #[test]
    fn sentinels_are_not_startable() {
        assert!(!UpgradeStateName::None.is_startable());
        assert!(!UpgradeStateName::Completed.is_startable());
        assert!(!UpgradeStateName::Invalid.is_startable());
        assert!(UpgradeStateName::FabricUpgradeDownload.is_startable());
    }
}
