//! Cluster-wide fabric upgrade record
//!
//! A [`FabricUpgrade`] is never mutated while shared. The manager clones the
//! live record, changes the copy, persists it, and only then swaps it in.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strata_core::{FabricUpgradeSpecification, FabricVersionInstance, NodeId, UpgradeDomains};

use crate::messages::UpgradeFabricRequest;

/// What the cluster manager asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricUpgradeDescription {
    /// Target version and attempt
    pub specification: FabricUpgradeSpecification,
    /// How long a node may wait on replica set safety checks
    pub upgrade_replica_set_check_timeout: Duration,
    /// Domains signed off for manual or monitored upgrades
    pub verified_upgrade_domains: BTreeSet<String>,
    /// Orders updates of the same attempt
    pub sequence_number: u64,
    /// Whether this attempt rolls back a failed one
    pub is_rollback: bool,
}

impl From<&UpgradeFabricRequest> for FabricUpgradeDescription {
    fn from(request: &UpgradeFabricRequest) -> Self {
        Self {
            specification: request.specification.clone(),
            upgrade_replica_set_check_timeout: request.upgrade_replica_set_check_timeout,
            verified_upgrade_domains: request.verified_upgrade_domains.iter().cloned().collect(),
            sequence_number: request.sequence_number,
            is_rollback: request.is_rollback,
        }
    }
}

/// Pending write for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Matches the store
    NoChange,
    /// New record
    ToBeInserted,
    /// Existing record changed
    ToBeUpdated,
    /// Record is being removed
    ToBeDeleted,
}

/// Where the nodes of the current domain stand
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeProgress {
    /// Nodes asked to upgrade that have not finished
    pub pending: BTreeSet<NodeId>,
    /// Nodes at the target version, or down
    pub ready: BTreeSet<NodeId>,
    /// Nodes held back by replica set safety checks
    pub waiting: BTreeSet<NodeId>,
}

impl UpgradeProgress {
    /// Whether no node in the domain is still moving
    pub fn is_domain_done(&self) -> bool {
        self.pending.is_empty() && self.waiting.is_empty()
    }
}

/// Live fabric upgrade
#[derive(Debug, Clone)]
pub struct FabricUpgrade {
    description: FabricUpgradeDescription,
    upgrade_domains: Arc<UpgradeDomains>,
    completed_domains: BTreeSet<String>,
    persistence_state: PersistenceState,
    domain_started_at: Instant,
    progress: UpgradeProgress,
}

impl FabricUpgrade {
    /// New upgrade over `upgrade_domains`, first domain starting at `now`
    pub fn new(
        description: FabricUpgradeDescription,
        upgrade_domains: Arc<UpgradeDomains>,
        now: Instant,
    ) -> Self {
        Self {
            description,
            upgrade_domains,
            completed_domains: BTreeSet::new(),
            persistence_state: PersistenceState::ToBeInserted,
            domain_started_at: now,
            progress: UpgradeProgress::default(),
        }
    }

    /// Restore a persisted upgrade
    pub fn restore(
        description: FabricUpgradeDescription,
        upgrade_domains: Arc<UpgradeDomains>,
        completed_domains: BTreeSet<String>,
        now: Instant,
    ) -> Self {
        Self {
            completed_domains,
            persistence_state: PersistenceState::NoChange,
            ..Self::new(description, upgrade_domains, now)
        }
    }

    /// Request this upgrade carries out
    pub fn description(&self) -> &FabricUpgradeDescription {
        &self.description
    }

    /// Upgrade attempt
    pub fn instance_id(&self) -> u64 {
        self.description.specification.instance_id
    }

    /// Version nodes move to
    pub fn target(&self) -> FabricVersionInstance {
        self.description.specification.version_instance()
    }

    /// Domain order snapshot
    pub fn upgrade_domains(&self) -> &Arc<UpgradeDomains> {
        &self.upgrade_domains
    }

    /// Domains that finished
    pub fn completed_domains(&self) -> &BTreeSet<String> {
        &self.completed_domains
    }

    /// Finished domains in upgrade order, including ones that left the cluster
    pub fn completed_domains_in_order(&self) -> Vec<String> {
        let mut ordered: Vec<String> = self
            .upgrade_domains
            .iter()
            .filter(|d| self.completed_domains.contains(*d))
            .map(str::to_string)
            .collect();
        ordered.extend(
            self.completed_domains
                .iter()
                .filter(|d| !self.upgrade_domains.contains(d))
                .cloned(),
        );
        ordered
    }

    /// Pending store write
    pub fn persistence_state(&self) -> PersistenceState {
        self.persistence_state
    }

    /// Mark the pending store write
    pub fn set_persistence_state(&mut self, state: PersistenceState) {
        self.persistence_state = state;
    }

    /// When the current domain started
    pub fn domain_started_at(&self) -> Instant {
        self.domain_started_at
    }

    /// Last reported node progress in the current domain
    pub fn progress(&self) -> &UpgradeProgress {
        &self.progress
    }

    /// Replace the node progress
    pub fn set_progress(&mut self, progress: UpgradeProgress) {
        self.progress = progress;
    }

    /// Merge an update of the same attempt; true when anything changed
    pub fn update(&mut self, description: &FabricUpgradeDescription) -> bool {
        debug_assert_eq!(description.specification.instance_id, self.instance_id());
        let mut changed = false;
        if self.description.upgrade_replica_set_check_timeout
            != description.upgrade_replica_set_check_timeout
        {
            self.description.upgrade_replica_set_check_timeout =
                description.upgrade_replica_set_check_timeout;
            changed = true;
        }
        if self.description.verified_upgrade_domains != description.verified_upgrade_domains {
            self.description.verified_upgrade_domains = description.verified_upgrade_domains.clone();
            changed = true;
        }
        if self.description.sequence_number != description.sequence_number {
            self.description.sequence_number = description.sequence_number;
            changed = true;
        }
        changed
    }

    /// First domain in order that has not finished
    pub fn current_domain(&self) -> Option<&str> {
        self.upgrade_domains
            .iter()
            .find(|d| !self.completed_domains.contains(*d))
    }

    /// Whether the current domain may begin
    ///
    /// Manual and monitored upgrades wait until every finished domain has
    /// been verified.
    pub fn can_start_current_domain(&self) -> bool {
        let spec = &self.description.specification;
        if !spec.is_manual && !spec.is_monitored {
            return true;
        }
        self.completed_domains
            .iter()
            .all(|d| self.description.verified_upgrade_domains.contains(d))
    }

    /// Whether nodes of `domain` finished upgrading
    pub fn is_domain_completed(&self, domain: &str) -> bool {
        self.completed_domains.contains(domain)
    }

    /// Whether nodes of `domain` have been told to upgrade
    pub fn is_domain_started(&self, domain: &str) -> bool {
        self.is_domain_completed(domain)
            || (self.current_domain() == Some(domain) && self.can_start_current_domain())
    }

    /// Mark the current domain finished; the next one starts at `now`
    pub fn complete_current_domain(&mut self, now: Instant) -> Option<String> {
        let domain = self.current_domain()?.to_string();
        self.completed_domains.insert(domain.clone());
        self.domain_started_at = now;
        self.progress = UpgradeProgress::default();
        Some(domain)
    }

    /// Whether every domain finished
    pub fn is_completed(&self) -> bool {
        self.current_domain().is_none()
    }

    /// Swap in a newer domain snapshot; finished domains carry over
    pub fn refresh_domains(&mut self, upgrade_domains: Arc<UpgradeDomains>) -> bool {
        if upgrade_domains.generation() <= self.upgrade_domains.generation() {
            return false;
        }
        self.upgrade_domains = upgrade_domains;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{FabricVersion, UpgradeDomainSortPolicy};

    fn upgrade(manual: bool, domains: &[&str]) -> FabricUpgrade {
        let mut spec = FabricUpgradeSpecification::rolling(FabricVersion::new("2.0", "1"), 5);
        spec.is_manual = manual;
        let request = UpgradeFabricRequest::new(spec);
        let domains = Arc::new(UpgradeDomains::new(
            UpgradeDomainSortPolicy::DigitsAsNumbers,
            domains.iter().copied(),
            1,
        ));
        FabricUpgrade::new((&request).into(), domains, Instant::now())
    }

    #[test]
    fn domains_complete_in_order() {
        let mut up = upgrade(false, &["10", "2", "1"]);
        assert_eq!(up.current_domain(), Some("1"));
        assert!(up.is_domain_started("1"));
        assert!(!up.is_domain_started("2"));

        let now = Instant::now();
        assert_eq!(up.complete_current_domain(now).as_deref(), Some("1"));
        assert_eq!(up.current_domain(), Some("2"));
        up.complete_current_domain(now);
        up.complete_current_domain(now);
        assert!(up.is_completed());
        assert_eq!(up.completed_domains_in_order(), vec!["1", "2", "10"]);
        assert_eq!(up.complete_current_domain(now), None);
    }

    #[test]
    fn manual_upgrade_waits_for_verification() {
        let mut up = upgrade(true, &["a", "b"]);
        assert!(up.is_domain_started("a"));
        up.complete_current_domain(Instant::now());
        assert!(!up.can_start_current_domain());
        assert!(!up.is_domain_started("b"));

        let mut description = up.description().clone();
        description.verified_upgrade_domains.insert("a".into());
        assert!(up.update(&description));
        assert!(!up.update(&description));
        assert!(up.is_domain_started("b"));
    }

    #[test]
    fn refresh_keeps_completed_domains() {
        let mut up = upgrade(false, &["a", "b"]);
        up.complete_current_domain(Instant::now());
        let newer = Arc::new(UpgradeDomains::new(
            UpgradeDomainSortPolicy::Lexicographical,
            ["a", "b", "c"],
            2,
        ));
        assert!(up.refresh_domains(Arc::clone(&newer)));
        assert!(!up.refresh_domains(newer));
        assert_eq!(up.current_domain(), Some("b"));
        assert!(up.is_domain_completed("a"));
    }
}
