//! Upgrade domain ordering
//!
//! Rolling upgrades walk upgrade domains in one fixed, cluster-wide order. The
//! order is produced here from the set of domains the node cache knows about.
//!
//! ## Architecture
//!
//! - [`UpgradeDomainSortPolicy`] picks plain lexicographic ordering or
//!   "digits as numbers" ordering where `UD10` sorts after `UD9`
//! - [`UpgradeDomains`] is an immutable sorted snapshot stamped with the
//!   generation of the registry that produced it
//! - [`UpgradeDomainRegistry`] tracks domain membership and bumps its
//!   generation on every topology change, so holders of a snapshot can tell
//!   whether it went stale without a shared dirty flag

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// How upgrade domain names are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeDomainSortPolicy {
    /// Byte-wise string comparison
    Lexicographical,
    /// Runs of ASCII digits compare by numeric value
    DigitsAsNumbers,
}

impl UpgradeDomainSortPolicy {
    /// Policy selected by the `sort_upgrade_domain_names_as_numbers` setting
    pub fn from_config(sort_as_numbers: bool) -> Self {
        if sort_as_numbers {
            Self::DigitsAsNumbers
        } else {
            Self::Lexicographical
        }
    }

    /// Compare two domain names under this policy
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Self::Lexicographical => a.cmp(b),
            Self::DigitsAsNumbers => compare_digits_as_numbers(a, b).then_with(|| a.cmp(b)),
        }
    }
}

fn compare_digits_as_numbers(a: &str, b: &str) -> Ordering {
    let mut left = Segments::new(a);
    let mut right = Segments::new(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (is_digits(x), is_digits(y)) {
                    (true, true) => compare_numeric(x, y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn is_digits(segment: &str) -> bool {
    segment.bytes().all(|b| b.is_ascii_digit())
}

// Arbitrary length digit runs: strip leading zeros, longer is larger.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

struct Segments<'a> {
    rest: &'a str,
}

impl<'a> Segments<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let first = self.rest.chars().next()?;
        let digit = first.is_ascii_digit();
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digit)
            .map_or(self.rest.len(), |(i, _)| i);
        let (segment, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(segment)
    }
}

/// Immutable, sorted snapshot of the cluster's upgrade domains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDomains {
    policy: UpgradeDomainSortPolicy,
    domains: Vec<String>,
    generation: u64,
}

impl UpgradeDomains {
    /// Sort and deduplicate `names` under `policy`
    pub fn new<I, S>(policy: UpgradeDomainSortPolicy, names: I, generation: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut domains: Vec<String> = names.into_iter().map(Into::into).collect();
        domains.sort_by(|a, b| policy.compare(a, b));
        domains.dedup();
        Self {
            policy,
            domains,
            generation,
        }
    }

    /// Domains in upgrade order
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Sort policy used to build this snapshot
    pub fn policy(&self) -> UpgradeDomainSortPolicy {
        self.policy
    }

    /// Registry generation this snapshot reflects
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the registry moved on since this snapshot was taken
    pub fn is_stale(&self, current_generation: u64) -> bool {
        self.generation < current_generation
    }

    /// Whether `domain` is part of the snapshot
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }

    /// Number of domains
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether the snapshot has no domains
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Iterate domains in upgrade order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    members: BTreeMap<String, BTreeSet<NodeId>>,
    generation: u64,
    cached: HashMap<UpgradeDomainSortPolicy, Arc<UpgradeDomains>>,
}

impl RegistryState {
    fn changed(&mut self) {
        self.generation += 1;
        self.cached.clear();
    }
}

/// Tracks which nodes belong to which upgrade domain
#[derive(Debug, Default)]
pub struct UpgradeDomainRegistry {
    state: RwLock<RegistryState>,
}

impl UpgradeDomainRegistry {
    /// Create an empty registry at generation zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `node` in `domain`, moving it out of any previous domain
    ///
    /// Returns whether the topology changed.
    pub fn add_node(&self, domain: &str, node: NodeId) -> bool {
        let mut state = self.state.write();
        if state
            .members
            .get(domain)
            .is_some_and(|nodes| nodes.contains(&node))
        {
            return false;
        }
        for nodes in state.members.values_mut() {
            nodes.remove(&node);
        }
        state.members.retain(|_, nodes| !nodes.is_empty());
        state
            .members
            .entry(domain.to_string())
            .or_default()
            .insert(node);
        state.changed();
        true
    }

    /// Remove `node` from the registry; empty domains disappear
    pub fn remove_node(&self, node: NodeId) -> bool {
        let mut state = self.state.write();
        let before: usize = state.members.values().map(BTreeSet::len).sum();
        for nodes in state.members.values_mut() {
            nodes.remove(&node);
        }
        state.members.retain(|_, nodes| !nodes.is_empty());
        let after: usize = state.members.values().map(BTreeSet::len).sum();
        if before == after {
            return false;
        }
        state.changed();
        true
    }

    /// Current topology generation
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Sorted snapshot for `policy`, shared until the topology changes
    pub fn snapshot(&self, policy: UpgradeDomainSortPolicy) -> Arc<UpgradeDomains> {
        if let Some(cached) = self.state.read().cached.get(&policy) {
            return Arc::clone(cached);
        }
        let mut state = self.state.write();
        let generation = state.generation;
        let snapshot = Arc::new(UpgradeDomains::new(
            policy,
            state.members.keys().cloned(),
            generation,
        ));
        state.cached.insert(policy, Arc::clone(&snapshot));
        snapshot
    }

    /// Nodes currently in `domain`
    pub fn nodes_in(&self, domain: &str) -> Vec<NodeId> {
        self.state
            .read()
            .members
            .get(domain)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }
}
