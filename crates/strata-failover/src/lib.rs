//! # Strata Failover
//!
//! Failover manager side of cluster fabric upgrades.
//!
//! ## Architecture
//!
//! - **Upgrade record**: [`FabricUpgrade`] tracks domain progression and is
//!   replaced copy-on-write, never edited while shared
//! - **Upgrade manager**: [`FabricUpgradeManager`] accepts, merges or rejects
//!   upgrade requests, records node progress and completes the upgrade in
//!   persist-then-publish order
//! - **Background scan**: [`FabricUpgradeContext`] moves nodes of the current
//!   domain through the upgrade, honoring replica set safety checks
//! - **Replica reconciliation**: [`ReplicasUpdateOperation`] resolves every
//!   failover unit of a replica batch exactly once and replies once
//! - **Failover units**: [`FailoverUnitCache`] runs at most one task per unit
//! - **Health**: [`HealthReportFactory`] builds node, service, partition and
//!   cluster upgrade reports
//! - **Facade**: [`FailoverManager`] routes messages and runs the scan
//!
//! Persistence, transport, placement and health delivery are traits injected
//! at construction.

pub mod fabric_upgrade;
pub mod failover_manager;
pub mod failover_unit;
pub mod failover_unit_cache;
pub mod health;
pub mod messages;
pub mod node_cache;
pub mod placement;
pub mod replica_update;
pub mod sender;
pub mod service;
pub mod store;
pub mod upgrade_context;
pub mod upgrade_manager;

pub use fabric_upgrade::{FabricUpgrade, FabricUpgradeDescription, PersistenceState, UpgradeProgress};
pub use failover_manager::{FailoverManager, FailoverManagerDependencies};
pub use failover_unit::{FailoverUnit, FailoverUnitHealthState, Replica, ReplicaState};
pub use failover_unit_cache::{FailoverUnitCache, FailoverUnitTask};
pub use health::{
    FailoverUnitHealthTracker, HealthEntity, HealthReport, HealthReportFactory, HealthReporter,
    HealthState, HEALTH_SOURCE_ID,
};
pub use messages::{
    CancelFabricUpgradeReply, NodeFabricUpgradeReply, NodeFabricUpgradeRequest, NodeUpMessage,
    NodeUpReply, ReplicaInfo, ReplicaUpMessage, ReplicaUpReply, UpgradeFabricReply,
    UpgradeFabricRequest,
};
pub use node_cache::{DeactivationIntent, MemoryNodeCache, NodeCache, NodeInfo};
pub use placement::PlacementSignal;
pub use replica_update::{
    ReplicaResolution, ReplicaUpProcessingOperation, ReplicaUpdateContext, ReplicaUpdateTask,
    ReplicasUpdateHandler, ReplicasUpdateOperation, ReplicasUpdateResult,
};
pub use sender::NodeSender;
pub use service::{InBuildFailoverUnitCache, InBuildOutcome, ServiceInfo, ServiceLookup};
pub use store::FailoverStore;
pub use upgrade_context::{FabricUpgradeContext, NoSafetyCheck, ReplicaSetSafetyCheck};
pub use upgrade_manager::{FabricUpgradeManager, UpgradeManagerContext};
