//! In-memory failover store with failure injection

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use strata_core::{FabricVersionInstance, FailoverUnitId, NodeId, Result, StrataError};
use strata_failover::{FabricUpgrade, FailoverStore, FailoverUnit, NodeInfo, PersistenceState};

/// Store call a fault can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `update_fabric_upgrade`
    FabricUpgrade,
    /// `update_fabric_version_instance`
    FabricVersionInstance,
    /// `update_node`
    Node,
    /// `update_failover_unit`
    FailoverUnit,
}

/// Persisted upgrade record as the store saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeWrite {
    /// Upgrade attempt
    pub instance_id: u64,
    /// Requested write
    pub persistence_state: PersistenceState,
    /// Completed domains at write time
    pub completed_domains: Vec<String>,
}

#[derive(Default)]
struct StoreContents {
    upgrade: Option<UpgradeWrite>,
    upgrade_writes: Vec<UpgradeWrite>,
    version: Option<FabricVersionInstance>,
    nodes: HashMap<NodeId, NodeInfo>,
    failover_units: HashMap<FailoverUnitId, FailoverUnit>,
    faults: HashMap<StoreOperation, usize>,
}

/// [`FailoverStore`] that keeps everything in memory
#[derive(Default)]
pub struct MemoryStore {
    contents: Mutex<StoreContents>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls of `operation`
    pub fn fail_next(&self, operation: StoreOperation, count: usize) {
        self.contents.lock().faults.insert(operation, count);
    }

    /// Successful writes of any kind
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current upgrade record
    pub fn upgrade(&self) -> Option<UpgradeWrite> {
        self.contents.lock().upgrade.clone()
    }

    /// Every successful upgrade write, in order
    pub fn upgrade_writes(&self) -> Vec<UpgradeWrite> {
        self.contents.lock().upgrade_writes.clone()
    }

    /// Persisted cluster version
    pub fn version(&self) -> Option<FabricVersionInstance> {
        self.contents.lock().version.clone()
    }

    /// Persisted node record
    pub fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.contents.lock().nodes.get(&id).cloned()
    }

    /// Persisted failover unit
    pub fn failover_unit(&self, id: FailoverUnitId) -> Option<FailoverUnit> {
        self.contents.lock().failover_units.get(&id).cloned()
    }

    fn check(contents: &mut StoreContents, operation: StoreOperation) -> Result<()> {
        match contents.faults.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StrataError::store(format!("injected {operation:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn committed(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl FailoverStore for MemoryStore {
    fn update_fabric_upgrade(&self, upgrade: &FabricUpgrade) -> Result<()> {
        let mut contents = self.contents.lock();
        Self::check(&mut contents, StoreOperation::FabricUpgrade)?;
        let write = UpgradeWrite {
            instance_id: upgrade.instance_id(),
            persistence_state: upgrade.persistence_state(),
            completed_domains: upgrade.completed_domains_in_order(),
        };
        contents.upgrade = match write.persistence_state {
            PersistenceState::ToBeDeleted => None,
            _ => Some(write.clone()),
        };
        contents.upgrade_writes.push(write);
        self.committed();
        Ok(())
    }

    fn update_fabric_version_instance(&self, version: &FabricVersionInstance) -> Result<()> {
        let mut contents = self.contents.lock();
        Self::check(&mut contents, StoreOperation::FabricVersionInstance)?;
        contents.version = Some(version.clone());
        self.committed();
        Ok(())
    }

    fn update_node(&self, node: &NodeInfo) -> Result<()> {
        let mut contents = self.contents.lock();
        Self::check(&mut contents, StoreOperation::Node)?;
        contents.nodes.insert(node.id(), node.clone());
        self.committed();
        Ok(())
    }

    fn update_failover_unit(&self, unit: &FailoverUnit) -> Result<()> {
        let mut contents = self.contents.lock();
        Self::check(&mut contents, StoreOperation::FailoverUnit)?;
        contents.failover_units.insert(unit.id, unit.clone());
        self.committed();
        Ok(())
    }
}
