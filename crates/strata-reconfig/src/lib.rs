//! # Strata Reconfig
//!
//! Node-side upgrade machinery of the reconfiguration agent.
//!
//! ## Architecture
//!
//! - **State machine**: [`UpgradeStateMachine`] drives any [`Upgrade`] strategy
//!   through timer, async API and normal states, with cooperative cancellation
//!   and deferred rollback
//! - **Async operations**: [`AsyncOperation`] resolves exactly once, whether by
//!   completion or cancellation
//! - **Fabric upgrade**: [`FabricUpgrade`] downloads, validates, closes
//!   replicas when needed and swaps the node to the new version
//! - **Message routing**: [`UpgradeMessageProcessor`] keeps one machine per key
//!   and rolls older attempts back before starting newer ones
//! - **Agent**: [`FabricUpgradeAgent`] filters stale messages and answers the
//!   failover manager

pub mod agent;
pub mod async_op;
pub mod fabric_upgrade;
pub mod hosting;
pub mod message_processor;
pub mod staleness;
pub mod state;
pub mod state_machine;
pub mod upgrade;

pub use agent::FabricUpgradeAgent;
pub use async_op::AsyncOperation;
pub use fabric_upgrade::FabricUpgrade;
pub use hosting::{FmTransport, HostingEffects, NodeUpgradeContext, ReplicaCloser, SharedNodeVersion};
pub use message_processor::UpgradeMessageProcessor;
pub use staleness::{
    check_fabric_upgrade_at_upgrade_message, is_cancel_relevant, FabricUpgradeStalenessCheckResult,
};
pub use state::{
    decide_cancel_action, CancelAction, CancelBehaviorType, LifeCycleState, RollbackSnapshot,
    UpgradeCancelMode, UpgradeCancelResult, UpgradeStateDescription, UpgradeStateKind,
    UpgradeStateName,
};
pub use state_machine::{CancelCompletion, StateCompletion, UpgradeStateMachine};
pub use upgrade::Upgrade;
