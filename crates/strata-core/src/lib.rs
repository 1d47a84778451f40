//! # Strata Core
//!
//! Shared vocabulary of the failover manager (FM) and the reconfiguration
//! agent (RA).
//!
//! ## Architecture
//!
//! - **Identifiers**: [`NodeId`], [`NodeInstance`], [`FailoverUnitId`]
//! - **Versions**: [`FabricVersionInstance`] ordered by upgrade instance,
//!   used for every staleness check
//! - **Upgrade domains**: deterministic domain ordering and a registry whose
//!   generation counter tells snapshot holders when topology changed
//! - **Errors**: [`StrataError`] with compact [`ErrorCodeValue`] for replies
//! - **Configuration**: [`FailoverConfig`] and [`ReconfigurationConfig`]
//!   loaded from TOML/JSON and `STRATA_` environment variables
//! - **Effects**: [`RuntimeEffects`] for posts, timers and spawned futures,
//!   with the tokio-backed [`TaskRegistry`]

pub mod config;
pub mod effects;
pub mod errors;
pub mod ids;
pub mod upgrade_domains;
pub mod version;

pub use config::{FailoverConfig, ReconfigurationConfig, StrataConfig};
pub use effects::{RuntimeEffects, SharedRuntime, Task, TaskRegistry, TimerHandle};
pub use errors::{ErrorCodeValue, Result, StrataError};
pub use ids::{FailoverUnitId, NodeId, NodeInstance};
pub use upgrade_domains::{UpgradeDomainRegistry, UpgradeDomainSortPolicy, UpgradeDomains};
pub use version::{FabricUpgradeSpecification, FabricVersion, FabricVersionInstance, UpgradeType};
