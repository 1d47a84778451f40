//! Strategy interface plugged into [`crate::UpgradeStateMachine`]
//!
//! The machine knows nothing about what an upgrade does. A strategy owns the
//! state graph: where to start, how each state behaves, what comes next, and
//! how to tell the failover manager that the node finished.

use crate::async_op::AsyncOperation;
use crate::state::{RollbackSnapshot, UpgradeStateDescription, UpgradeStateName};
use crate::state_machine::StateCompletion;

/// Behavior of one kind of upgrade
///
/// Methods are called without the machine's lock held, so an implementation
/// may call back into the machine. `state_description` is the exception: it
/// is consulted under the lock and must be a pure lookup.
pub trait Upgrade: Send + Sync {
    /// Activity id for traces
    fn activity_id(&self) -> &str;

    /// Upgrade attempt this strategy runs; newer instances supersede older ones
    fn instance_id(&self) -> u64;

    /// First state, given where a rolled-back predecessor stopped
    fn get_start_state(&self, rollback: Option<&RollbackSnapshot>) -> UpgradeStateName;

    /// Static description of `state`
    fn state_description(&self, state: UpgradeStateName) -> UpgradeStateDescription;

    /// Run a normal state
    ///
    /// Returns the next state, or [`UpgradeStateName::Invalid`] after arranging
    /// for `completion` to be called with the next state later.
    fn enter_state(&self, state: UpgradeStateName, completion: StateCompletion) -> UpgradeStateName;

    /// Start the work of an async API state and resolve `operation` when done
    ///
    /// Resolving before returning counts as synchronous completion.
    fn enter_async_operation_state(&self, state: UpgradeStateName, operation: AsyncOperation);

    /// Next state once `operation` resolved
    fn exit_async_operation_state(
        &self,
        state: UpgradeStateName,
        operation: &AsyncOperation,
    ) -> UpgradeStateName;

    /// Snapshot a closed machine stopped in `state`
    fn create_rollback_snapshot(&self, state: UpgradeStateName) -> RollbackSnapshot;

    /// Tell the failover manager this node finished
    fn send_reply(&self);
}
