//! Fabric versions and version instances
//!
//! A [`FabricVersionInstance`] pairs a code/config version with a monotonically
//! increasing instance id that identifies one upgrade attempt. Staleness checks
//! everywhere in the failover manager and reconfiguration agent compare
//! instances first; the version only breaks ties.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Code and config version pair of the fabric runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FabricVersion {
    /// Binary version, e.g. `6.4.617.9590`
    pub code_version: String,
    /// Cluster manifest version
    pub config_version: String,
}

impl FabricVersion {
    /// Create a version from its two parts
    pub fn new(code_version: impl Into<String>, config_version: impl Into<String>) -> Self {
        Self {
            code_version: code_version.into(),
            config_version: config_version.into(),
        }
    }

    /// Whether neither part has been set
    pub fn is_default(&self) -> bool {
        self.code_version.is_empty() && self.config_version.is_empty()
    }

    /// Whether the binaries differ, which forces replicas to restart
    pub fn is_code_change_from(&self, other: &FabricVersion) -> bool {
        self.code_version != other.code_version
    }
}

impl fmt::Display for FabricVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code_version, self.config_version)
    }
}

/// A version tagged with the upgrade attempt that produced it
///
/// Instance 0 with a default version means "no baseline yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FabricVersionInstance {
    /// Target version
    pub version: FabricVersion,
    /// Upgrade attempt counter
    pub instance_id: u64,
}

impl FabricVersionInstance {
    /// Create a version instance
    pub fn new(version: FabricVersion, instance_id: u64) -> Self {
        Self {
            version,
            instance_id,
        }
    }

    /// Whether this carries no baseline
    pub fn is_default(&self) -> bool {
        self.instance_id == 0 && self.version.is_default()
    }

    /// Whether `self` is older than `other` by instance id
    pub fn is_stale_against(&self, other: &FabricVersionInstance) -> bool {
        self.instance_id < other.instance_id
    }
}

impl Ord for FabricVersionInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instance_id
            .cmp(&other.instance_id)
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for FabricVersionInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FabricVersionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.instance_id)
    }
}

/// How a node applies the new version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeType {
    /// Replicas are restarted only when the new version requires it
    #[default]
    Rolling,
    /// Replicas are always restarted
    RollingForceRestart,
}

/// What a fabric upgrade asks nodes to move to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricUpgradeSpecification {
    /// Target version
    pub version: FabricVersion,
    /// Upgrade attempt counter
    pub instance_id: u64,
    /// Restart policy
    pub upgrade_type: UpgradeType,
    /// Whether health is checked between domains
    pub is_monitored: bool,
    /// Whether an operator moves the upgrade between domains
    pub is_manual: bool,
}

impl FabricUpgradeSpecification {
    /// Rolling, unmonitored, automatic specification
    pub fn rolling(version: FabricVersion, instance_id: u64) -> Self {
        Self {
            version,
            instance_id,
            upgrade_type: UpgradeType::Rolling,
            is_monitored: false,
            is_manual: false,
        }
    }

    /// Target as a version instance
    pub fn version_instance(&self) -> FabricVersionInstance {
        FabricVersionInstance::new(self.version.clone(), self.instance_id)
    }
}

impl fmt::Display for FabricUpgradeSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {:?} monitored={} manual={}",
            self.version, self.instance_id, self.upgrade_type, self.is_monitored, self.is_manual
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vi(code: &str, instance: u64) -> FabricVersionInstance {
        FabricVersionInstance::new(FabricVersion::new(code, "cfg"), instance)
    }

    #[test]
    fn instance_dominates_version_in_ordering() {
        assert!(vi("1.0", 5) > vi("9.0", 4));
        assert!(vi("1.0", 5) < vi("2.0", 5));
        assert!(vi("2.0", 3).is_stale_against(&vi("1.0", 4)));
    }

    #[test]
    fn default_has_no_baseline() {
        assert!(FabricVersionInstance::default().is_default());
        assert!(!vi("1.0", 0).is_default());
        assert!(FabricVersionInstance::default() < vi("1.0", 1));
    }

    #[test]
    fn code_change_detection_ignores_config() {
        let a = FabricVersion::new("1.0", "a");
        let b = FabricVersion::new("1.0", "b");
        let c = FabricVersion::new("2.0", "a");
        assert!(!b.is_code_change_from(&a));
        assert!(c.is_code_change_from(&a));
    }

    proptest! {
        #[test]
        fn ordering_is_consistent_with_instance(a in 0u64..1000, b in 0u64..1000) {
            let left = vi("1.0", a);
            let right = vi("1.0", b);
            prop_assert_eq!(left.cmp(&right), a.cmp(&b));
            prop_assert_eq!(left.is_stale_against(&right), a < b);
        }
    }
}
