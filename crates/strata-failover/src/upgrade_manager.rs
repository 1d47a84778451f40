//! Cluster fabric upgrade state of the failover manager
//!
//! [`FabricUpgradeManager`] owns the last completed version and the optional
//! live [`FabricUpgrade`] behind one read/write lock. Every change goes
//! through the store first; the in-memory state only moves once the write
//! succeeded, so a failed write always leaves the previous state visible.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use strata_core::{
    ErrorCodeValue, FabricVersionInstance, FailoverConfig, NodeInstance, Result, SharedRuntime,
    StrataError,
};

use crate::fabric_upgrade::{FabricUpgrade, FabricUpgradeDescription, PersistenceState, UpgradeProgress};
use crate::messages::{
    CancelFabricUpgradeReply, NodeFabricUpgradeReply, UpgradeFabricReply, UpgradeFabricRequest,
};
use crate::node_cache::NodeCache;
use crate::placement::PlacementSignal;
use crate::store::FailoverStore;

struct ManagerState {
    current: FabricVersionInstance,
    upgrade: Option<Arc<FabricUpgrade>>,
}

/// Collaborators of the upgrade manager
#[derive(Clone)]
pub struct UpgradeManagerContext {
    /// Persistence
    pub store: Arc<dyn FailoverStore>,
    /// Upgrade status sink for placement
    pub placement: Arc<dyn PlacementSignal>,
    /// Node records and domain snapshots
    pub nodes: Arc<dyn NodeCache>,
    /// Clock
    pub runtime: SharedRuntime,
    /// Domain sort policy
    pub config: FailoverConfig,
}

/// Cluster-wide fabric upgrade bookkeeping
pub struct FabricUpgradeManager {
    state: RwLock<ManagerState>,
    context: UpgradeManagerContext,
}

impl FabricUpgradeManager {
    /// Manager with no live upgrade, at `current`
    pub fn new(context: UpgradeManagerContext, current: FabricVersionInstance) -> Self {
        Self::load(context, current, None)
    }

    /// Manager restored from persisted state
    pub fn load(
        context: UpgradeManagerContext,
        current: FabricVersionInstance,
        upgrade: Option<FabricUpgrade>,
    ) -> Self {
        if let Some(upgrade) = &upgrade {
            context
                .placement
                .update_cluster_upgrade(true, upgrade.completed_domains().clone());
        }
        Self {
            state: RwLock::new(ManagerState {
                current,
                upgrade: upgrade.map(Arc::new),
            }),
            context,
        }
    }

    /// Last completed version
    pub fn current_version_instance(&self) -> FabricVersionInstance {
        self.state.read().current.clone()
    }

    /// Live upgrade, if any
    pub fn upgrade(&self) -> Option<Arc<FabricUpgrade>> {
        self.state.read().upgrade.clone()
    }

    /// Whether an upgrade is live
    pub fn is_upgrade_in_progress(&self) -> bool {
        self.state.read().upgrade.is_some()
    }

    /// Finished domains of the live upgrade, in upgrade order
    pub fn completed_upgrade_domains(&self) -> Vec<String> {
        self.state
            .read()
            .upgrade
            .as_ref()
            .map(|u| u.completed_domains_in_order())
            .unwrap_or_default()
    }

    fn all_domains(&self) -> Vec<String> {
        let policy = self.context.config.upgrade_domain_sort_policy();
        self.context.nodes.upgrade_domains(policy).domains().to_vec()
    }

    // =========================================================================
    // Cluster manager requests
    // =========================================================================

    /// Accept, merge, or reject an upgrade request
    pub fn process_fabric_upgrade(&self, request: &UpgradeFabricRequest) -> Result<UpgradeFabricReply> {
        let incoming = request.specification.instance_id;
        let mut state = self.state.write();

        let live_instance = state.upgrade.as_ref().map(|u| u.instance_id());
        if incoming < state.current.instance_id || live_instance.is_some_and(|live| incoming < live) {
            tracing::info!(
                incoming,
                current = %state.current,
                live = ?live_instance,
                "Stale fabric upgrade request"
            );
            return Err(StrataError::stale(format!(
                "upgrade instance {incoming} behind current {}",
                state.current
            )));
        }

        let description = FabricUpgradeDescription::from(request);

        if let Some(live) = state.upgrade.as_ref().filter(|u| u.instance_id() == incoming) {
            let mut updated = FabricUpgrade::clone(live);
            if updated.update(&description) {
                updated.set_persistence_state(PersistenceState::ToBeUpdated);
                if let Err(error) = self.context.store.update_fabric_upgrade(&updated) {
                    tracing::warn!(instance = incoming, error = %error, "Persisting upgrade update failed");
                    return Err(error);
                }
                tracing::info!(
                    instance = incoming,
                    sequence = description.sequence_number,
                    verified = ?description.verified_upgrade_domains,
                    "Fabric upgrade updated"
                );
                state.upgrade = Some(Arc::new(updated));
            }
            return Ok(Self::success(state.upgrade.as_deref()));
        }

        if incoming == state.current.instance_id && state.upgrade.is_none() {
            tracing::debug!(instance = incoming, "Fabric upgrade already completed");
            return Ok(UpgradeFabricReply {
                error: ErrorCodeValue::Success,
                completed_upgrade_domains: self.all_domains(),
            });
        }

        let policy = self.context.config.upgrade_domain_sort_policy();
        let domains = self.context.nodes.upgrade_domains(policy);
        let mut upgrade = FabricUpgrade::new(description, domains, self.context.runtime.now());
        if let Some(previous) = &state.upgrade {
            tracing::info!(
                previous = previous.instance_id(),
                instance = incoming,
                "Fabric upgrade superseded"
            );
            upgrade.set_persistence_state(PersistenceState::ToBeUpdated);
        }

        if let Err(error) = self.context.store.update_fabric_upgrade(&upgrade) {
            tracing::warn!(instance = incoming, error = %error, "Persisting new upgrade failed");
            return Err(error);
        }

        tracing::info!(
            target_version = %upgrade.target(),
            current = %state.current,
            domains = upgrade.upgrade_domains().len(),
            "Fabric upgrade started"
        );
        let completed = upgrade.completed_domains().clone();
        state.upgrade = Some(Arc::new(upgrade));
        self.context.placement.update_cluster_upgrade(true, completed);
        Ok(Self::success(state.upgrade.as_deref()))
    }

    fn success(upgrade: Option<&FabricUpgrade>) -> UpgradeFabricReply {
        UpgradeFabricReply {
            error: ErrorCodeValue::Success,
            completed_upgrade_domains: upgrade
                .map(FabricUpgrade::completed_domains_in_order)
                .unwrap_or_default(),
        }
    }

    // =========================================================================
    // Node replies
    // =========================================================================

    /// Version a node in `domain` should run right now
    pub fn target_version_for(&self, domain: &str) -> FabricVersionInstance {
        let state = self.state.read();
        match &state.upgrade {
            Some(upgrade) if upgrade.is_domain_started(domain) => upgrade.target(),
            _ => state.current.clone(),
        }
    }

    /// Record the version a node reached; mismatched replies are ignored
    pub async fn process_node_fabric_upgrade_reply(
        &self,
        reply: &NodeFabricUpgradeReply,
        from: NodeInstance,
    ) -> Result<()> {
        let Some(node) = self.context.nodes.get_node(from.id) else {
            tracing::debug!(from = %from, "Upgrade reply from unknown node");
            return Ok(());
        };
        let target = self.target_version_for(&node.upgrade_domain);
        if reply.version_instance != target {
            tracing::debug!(
                from = %from,
                reported = %reply.version_instance,
                target_version = %target,
                "Upgrade reply does not match target"
            );
            return Ok(());
        }
        self.context.nodes.update_version_instance(from, target).await
    }

    /// Clear a node's pending flag once it dropped a cancelled upgrade
    pub async fn process_cancel_fabric_upgrade_reply(
        &self,
        reply: &CancelFabricUpgradeReply,
        from: NodeInstance,
    ) -> Result<()> {
        let Some(node) = self.context.nodes.get_node(from.id) else {
            return Ok(());
        };
        let target = self.target_version_for(&node.upgrade_domain);
        if reply.version_instance != target || node.instance != from {
            tracing::debug!(
                from = %from,
                reported = %reply.version_instance,
                target_version = %target,
                "Cancel reply does not match target"
            );
            return Ok(());
        }
        self.context.nodes.set_pending_fabric_upgrade(&node, false).await
    }

    // =========================================================================
    // Background progress
    // =========================================================================

    /// Swap in a fresh domain snapshot when topology changed
    pub fn refresh_upgrade_domains(&self) -> bool {
        let generation = self.context.nodes.upgrade_domain_generation();
        let mut state = self.state.write();
        let Some(live) = state.upgrade.as_ref() else {
            return false;
        };
        if !live.upgrade_domains().is_stale(generation) {
            return false;
        }
        let policy = self.context.config.upgrade_domain_sort_policy();
        let mut updated = FabricUpgrade::clone(live);
        if !updated.refresh_domains(self.context.nodes.upgrade_domains(policy)) {
            return false;
        }
        tracing::debug!(
            instance = updated.instance_id(),
            generation = updated.upgrade_domains().generation(),
            "Upgrade domains refreshed"
        );
        state.upgrade = Some(Arc::new(updated));
        true
    }

    /// Apply node progress observed for `upgrade`
    ///
    /// Ignored unless `upgrade` is still the live attempt. The reported
    /// progress is kept even when persisting the domain transition fails.
    pub fn update_fabric_upgrade_progress(
        &self,
        upgrade: &FabricUpgrade,
        progress: UpgradeProgress,
        is_current_domain_complete: bool,
    ) -> Result<()> {
        let mut state = self.state.write();
        let Some(live) = state.upgrade.clone() else {
            return Ok(());
        };
        if live.instance_id() != upgrade.instance_id() {
            tracing::debug!(
                live = live.instance_id(),
                observed = upgrade.instance_id(),
                "Progress for superseded upgrade ignored"
            );
            return Ok(());
        }

        let mut updated = FabricUpgrade::clone(&live);
        updated.set_progress(progress.clone());
        let mut changed = false;
        if is_current_domain_complete && updated.can_start_current_domain() {
            if let Some(domain) = updated.complete_current_domain(self.context.runtime.now()) {
                tracing::info!(instance = updated.instance_id(), domain = %domain, "Upgrade domain completed");
                changed = true;
            }
        }

        if updated.is_completed() {
            let result = self.complete_fabric_upgrade_caller_holds_write_lock(&mut state, &updated);
            if result.is_err() {
                let mut kept = FabricUpgrade::clone(&live);
                kept.set_progress(progress);
                state.upgrade = Some(Arc::new(kept));
            }
            return result;
        }

        if changed {
            updated.set_persistence_state(PersistenceState::ToBeUpdated);
            if let Err(error) = self.context.store.update_fabric_upgrade(&updated) {
                tracing::warn!(instance = updated.instance_id(), error = %error, "Persisting upgrade progress failed");
                let mut kept = FabricUpgrade::clone(&live);
                kept.set_progress(progress);
                state.upgrade = Some(Arc::new(kept));
                return Err(error);
            }
            self.context
                .placement
                .update_cluster_upgrade(true, updated.completed_domains().clone());
        }
        state.upgrade = Some(Arc::new(updated));
        Ok(())
    }

    /// Persist the new version, delete the record, then drop the live upgrade
    ///
    /// Stops at the first failing write. The in-memory version and the live
    /// upgrade only change together, once both writes succeeded; a retry
    /// rewrites the version.
    fn complete_fabric_upgrade_caller_holds_write_lock(
        &self,
        state: &mut ManagerState,
        upgrade: &FabricUpgrade,
    ) -> Result<()> {
        let target = upgrade.target();
        if target != state.current {
            if let Err(error) = self.context.store.update_fabric_version_instance(&target) {
                tracing::warn!(target_version = %target, error = %error, "Persisting completed version failed");
                return Err(error);
            }
        }

        let mut deleted = upgrade.clone();
        deleted.set_persistence_state(PersistenceState::ToBeDeleted);
        if let Err(error) = self.context.store.update_fabric_upgrade(&deleted) {
            tracing::warn!(target_version = %target, error = %error, "Deleting upgrade record failed");
            return Err(error);
        }

        state.current = target.clone();
        state.upgrade = None;
        self.context
            .placement
            .update_cluster_upgrade(false, BTreeSet::new());
        tracing::info!(version = %target, "Fabric upgrade completed");
        Ok(())
    }

    // =========================================================================
    // Gatekeeping
    // =========================================================================

    /// Whether a node in `domain` running `incoming` must upgrade, and to what
    pub fn is_fabric_upgrade_needed(
        &self,
        incoming: &FabricVersionInstance,
        domain: &str,
    ) -> (bool, FabricVersionInstance) {
        let state = self.state.read();
        let target = match &state.upgrade {
            Some(upgrade) if upgrade.is_domain_completed(domain) => upgrade.target(),
            Some(upgrade) if upgrade.is_domain_started(domain) => {
                let target = upgrade.target();
                let accepted = *incoming == target || *incoming == state.current;
                return (!accepted, target);
            }
            _ => state.current.clone(),
        };

        if target.is_default() {
            return (false, target);
        }
        (*incoming != target, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use strata_core::{
        FabricUpgradeSpecification, FabricVersion, NodeId, RuntimeEffects, Task, TimerHandle,
        UpgradeDomainSortPolicy, UpgradeDomains,
    };

    use crate::failover_unit::FailoverUnit;
    use crate::node_cache::{DeactivationIntent, NodeInfo};

    struct StillClock(Instant);

    impl RuntimeEffects for StillClock {
        fn post(&self, _task: Task) {}
        fn schedule(&self, _delay: Duration, _task: Task) -> TimerHandle {
            TimerHandle::new()
        }
        fn spawn(&self, _fut: futures::future::BoxFuture<'static, ()>) {}
        fn now(&self) -> Instant {
            self.0
        }
    }

    #[derive(Default)]
    struct Store {
        writes: Mutex<Vec<PersistenceState>>,
        fail: Mutex<bool>,
    }

    impl FailoverStore for Store {
        fn update_fabric_upgrade(&self, upgrade: &FabricUpgrade) -> Result<()> {
            if *self.fail.lock() {
                return Err(StrataError::store("injected"));
            }
            self.writes.lock().push(upgrade.persistence_state());
            Ok(())
        }
        fn update_fabric_version_instance(&self, _version: &FabricVersionInstance) -> Result<()> {
            if *self.fail.lock() {
                return Err(StrataError::store("injected"));
            }
            Ok(())
        }
        fn update_node(&self, _node: &NodeInfo) -> Result<()> {
            Ok(())
        }
        fn update_failover_unit(&self, _unit: &FailoverUnit) -> Result<()> {
            Ok(())
        }
    }

    struct NoPlacement;

    impl PlacementSignal for NoPlacement {
        fn update_cluster_upgrade(&self, _in_progress: bool, _completed: BTreeSet<String>) {}
    }

    struct Domains(Vec<&'static str>);

    #[async_trait]
    impl NodeCache for Domains {
        fn upgrade_domains(&self, policy: UpgradeDomainSortPolicy) -> Arc<UpgradeDomains> {
            Arc::new(UpgradeDomains::new(policy, self.0.iter().copied(), 1))
        }
        fn upgrade_domain_generation(&self) -> u64 {
            1
        }
        fn get_node(&self, _id: NodeId) -> Option<NodeInfo> {
            None
        }
        fn nodes(&self) -> Vec<NodeInfo> {
            Vec::new()
        }
        fn node_up(&self, _node: NodeInfo) -> Result<()> {
            Ok(())
        }
        fn node_down(&self, _node: NodeInstance) -> Result<()> {
            Ok(())
        }
        fn deactivate_node(&self, _id: NodeId, _intent: DeactivationIntent) -> Result<()> {
            Ok(())
        }
        async fn update_version_instance(
            &self,
            _node: NodeInstance,
            _version: FabricVersionInstance,
        ) -> Result<()> {
            Ok(())
        }
        async fn set_pending_fabric_upgrade(&self, _node: &NodeInfo, _value: bool) -> Result<()> {
            Ok(())
        }
        async fn replica_uploaded(&self, _node: NodeInstance) -> Result<()> {
            Ok(())
        }
    }

    fn manager(store: Arc<Store>) -> FabricUpgradeManager {
        let context = UpgradeManagerContext {
            store,
            placement: Arc::new(NoPlacement),
            nodes: Arc::new(Domains(vec!["ud0", "ud1"])),
            runtime: Arc::new(StillClock(Instant::now())),
            config: FailoverConfig::default(),
        };
        let current = FabricVersionInstance::new(FabricVersion::new("1.0", "1"), 3);
        FabricUpgradeManager::new(context, current)
    }

    fn request(instance: u64) -> UpgradeFabricRequest {
        UpgradeFabricRequest::new(FabricUpgradeSpecification::rolling(
            FabricVersion::new("2.0", "1"),
            instance,
        ))
    }

    #[test]
    fn update_of_live_upgrade_merges() {
        let store = Arc::new(Store::default());
        let manager = manager(Arc::clone(&store));
        manager.process_fabric_upgrade(&request(5)).unwrap();

        let mut update = request(5);
        update.sequence_number = 2;
        manager.process_fabric_upgrade(&update).unwrap();
        manager.process_fabric_upgrade(&update).unwrap();

        assert_eq!(
            *store.writes.lock(),
            vec![PersistenceState::ToBeInserted, PersistenceState::ToBeUpdated]
        );
        let live = manager.upgrade().unwrap();
        assert_eq!(live.description().sequence_number, 2);
    }

    #[test]
    fn failed_merge_keeps_previous_record() {
        let store = Arc::new(Store::default());
        let manager = manager(Arc::clone(&store));
        manager.process_fabric_upgrade(&request(5)).unwrap();

        *store.fail.lock() = true;
        let mut update = request(5);
        update.sequence_number = 9;
        assert!(manager.process_fabric_upgrade(&update).is_err());
        assert_eq!(manager.upgrade().unwrap().description().sequence_number, 0);
    }

    #[test]
    fn newer_request_supersedes_live_upgrade() {
        let store = Arc::new(Store::default());
        let manager = manager(Arc::clone(&store));
        manager.process_fabric_upgrade(&request(5)).unwrap();
        manager.process_fabric_upgrade(&request(7)).unwrap();

        assert_eq!(manager.upgrade().unwrap().instance_id(), 7);
        assert_eq!(store.writes.lock().last(), Some(&PersistenceState::ToBeUpdated));
    }

    #[test]
    fn gatekeeping_follows_domain_progress() {
        let manager = manager(Arc::new(Store::default()));
        let old = manager.current_version_instance();
        manager.process_fabric_upgrade(&request(5)).unwrap();
        let upgrade = manager.upgrade().unwrap();
        let new = upgrade.target();

        assert_eq!(manager.is_fabric_upgrade_needed(&old, "ud0"), (false, new.clone()));
        assert_eq!(manager.is_fabric_upgrade_needed(&new, "ud0"), (false, new.clone()));
        assert_eq!(manager.is_fabric_upgrade_needed(&new, "ud1"), (true, old.clone()));

        manager
            .update_fabric_upgrade_progress(&upgrade, UpgradeProgress::default(), true)
            .unwrap();
        assert_eq!(manager.is_fabric_upgrade_needed(&old, "ud0"), (true, new.clone()));
        assert_eq!(manager.completed_upgrade_domains(), vec!["ud0".to_string()]);
    }
}
