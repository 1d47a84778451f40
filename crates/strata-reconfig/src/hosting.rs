//! Node-local collaborators of the fabric upgrade
//!
//! Package download, validation and the actual binary swap live in hosting.
//! Closing replicas belongs to the replica life cycle. Replies travel through
//! the federation transport. All three are outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use strata_core::{FabricUpgradeSpecification, FabricVersionInstance, ReconfigurationConfig, Result, SharedRuntime};

/// Hosting subsystem calls made by the fabric upgrade
#[async_trait]
pub trait HostingEffects: Send + Sync {
    /// Fetch the package for `specification`
    async fn download_fabric(&self, specification: &FabricUpgradeSpecification) -> Result<()>;

    /// Check the package; `Ok(true)` when replicas must close first
    async fn validate_fabric_upgrade(&self, specification: &FabricUpgradeSpecification)
        -> Result<bool>;

    /// Switch the node to the new version
    async fn fabric_upgrade(&self, specification: &FabricUpgradeSpecification) -> Result<()>;
}

/// Closes local replicas ahead of a restarting upgrade
pub trait ReplicaCloser: Send + Sync {
    /// Close every replica on the node and call `done` once they are closed
    ///
    /// `done` may be called before this returns.
    fn close_replicas(&self, activity_id: &str, done: Box<dyn FnOnce() + Send>);
}

/// Replies to the failover manager
pub trait FmTransport: Send + Sync {
    /// The node reached `version`
    fn send_node_fabric_upgrade_reply(&self, version: FabricVersionInstance);

    /// The node dropped a cancelled upgrade and runs `version`
    fn send_cancel_fabric_upgrade_reply(&self, version: FabricVersionInstance);
}

/// Version the node runs, shared between the agent and running upgrades
pub type SharedNodeVersion = Arc<RwLock<FabricVersionInstance>>;

/// Everything a node fabric upgrade needs
#[derive(Clone)]
pub struct NodeUpgradeContext {
    /// Hosting calls
    pub hosting: Arc<dyn HostingEffects>,
    /// Replica closing
    pub replicas: Arc<dyn ReplicaCloser>,
    /// Failover manager replies
    pub transport: Arc<dyn FmTransport>,
    /// Pool, timers and spawned futures
    pub runtime: SharedRuntime,
    /// Version the node runs
    pub node_version: SharedNodeVersion,
    /// Retry intervals
    pub config: ReconfigurationConfig,
}
