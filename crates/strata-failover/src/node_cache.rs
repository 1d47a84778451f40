//! Failover manager view of cluster nodes
//!
//! Every change is written to the store before it becomes visible. Node
//! records are replaced wholesale, never edited in place.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strata_core::{
    FabricVersionInstance, NodeId, NodeInstance, Result, StrataError, UpgradeDomainRegistry,
    UpgradeDomainSortPolicy, UpgradeDomains,
};

use crate::store::FailoverStore;

/// Why a node is being taken out of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeactivationIntent {
    /// Stop placing new replicas
    Pause,
    /// Move replicas off before a restart
    Restart,
    /// Move replicas off and wipe state
    RemoveData,
    /// Remove the node from the cluster
    RemoveNode,
}

/// Node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Current incarnation
    pub instance: NodeInstance,
    /// Upgrade domain the node belongs to
    pub upgrade_domain: String,
    /// Version the node runs
    pub version_instance: FabricVersionInstance,
    /// Whether the node is up
    pub is_up: bool,
    /// Whether the node was asked to upgrade and has not answered
    pub is_pending_fabric_upgrade: bool,
    /// Whether the node finished uploading its replicas after coming up
    pub is_replica_upload_complete: bool,
    /// Pending deactivation, if any
    pub deactivation: Option<DeactivationIntent>,
}

impl NodeInfo {
    /// Record for a node that just came up
    pub fn up(
        instance: NodeInstance,
        upgrade_domain: impl Into<String>,
        version_instance: FabricVersionInstance,
    ) -> Self {
        Self {
            instance,
            upgrade_domain: upgrade_domain.into(),
            version_instance,
            is_up: true,
            is_pending_fabric_upgrade: false,
            is_replica_upload_complete: false,
            deactivation: None,
        }
    }

    /// Node identity
    pub fn id(&self) -> NodeId {
        self.instance.id
    }
}

/// Node lookups and updates used by the upgrade engine
#[async_trait]
pub trait NodeCache: Send + Sync {
    /// Sorted domain snapshot; immutable once returned
    fn upgrade_domains(&self, policy: UpgradeDomainSortPolicy) -> Arc<UpgradeDomains>;

    /// Topology generation; snapshots from older generations are stale
    fn upgrade_domain_generation(&self) -> u64;

    /// Node record
    fn get_node(&self, id: NodeId) -> Option<NodeInfo>;

    /// Every node record
    fn nodes(&self) -> Vec<NodeInfo>;

    /// Add or replace a node record for an incarnation coming up
    fn node_up(&self, node: NodeInfo) -> Result<()>;

    /// Mark an incarnation down
    fn node_down(&self, node: NodeInstance) -> Result<()>;

    /// Record a deactivation request; repeating the same intent is a no-op
    fn deactivate_node(&self, id: NodeId, intent: DeactivationIntent) -> Result<()>;

    /// Record the version a node reached and clear its pending flag
    ///
    /// Skips the write when nothing changes.
    async fn update_version_instance(
        &self,
        node: NodeInstance,
        version: FabricVersionInstance,
    ) -> Result<()>;

    /// Set or clear the pending fabric upgrade flag
    async fn set_pending_fabric_upgrade(&self, node: &NodeInfo, value: bool) -> Result<()>;

    /// Mark the node's replica upload complete
    async fn replica_uploaded(&self, node: NodeInstance) -> Result<()>;
}

/// In-memory node cache backed by a [`FailoverStore`]
pub struct MemoryNodeCache {
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
    domains: UpgradeDomainRegistry,
    store: Arc<dyn FailoverStore>,
}

impl MemoryNodeCache {
    /// Empty cache persisting through `store`
    pub fn new(store: Arc<dyn FailoverStore>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            domains: UpgradeDomainRegistry::new(),
            store,
        }
    }

    /// Load persisted node records
    pub fn with_nodes(store: Arc<dyn FailoverStore>, nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        let cache = Self::new(store);
        {
            let mut map = cache.nodes.write();
            for node in nodes {
                cache.domains.add_node(&node.upgrade_domain, node.id());
                map.insert(node.id(), node);
            }
        }
        cache
    }

    fn commit<F>(&self, id: NodeId, change: F) -> Result<()>
    where
        F: FnOnce(&NodeInfo) -> Result<Option<NodeInfo>>,
    {
        let mut nodes = self.nodes.write();
        let current = nodes
            .get(&id)
            .ok_or_else(|| StrataError::node_not_found(format!("node {id}")))?;
        let Some(updated) = change(current)? else {
            return Ok(());
        };
        self.store.update_node(&updated)?;
        nodes.insert(id, updated);
        Ok(())
    }
}

#[async_trait]
impl NodeCache for MemoryNodeCache {
    fn upgrade_domains(&self, policy: UpgradeDomainSortPolicy) -> Arc<UpgradeDomains> {
        self.domains.snapshot(policy)
    }

    fn upgrade_domain_generation(&self) -> u64 {
        self.domains.generation()
    }

    fn get_node(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(&id).cloned()
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    fn node_up(&self, node: NodeInfo) -> Result<()> {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&node.id()) {
            if existing.instance.instance_id > node.instance.instance_id {
                return Err(StrataError::stale(format!(
                    "node up {} behind {}",
                    node.instance, existing.instance
                )));
            }
        }
        self.store.update_node(&node)?;
        self.domains.add_node(&node.upgrade_domain, node.id());
        tracing::info!(
            node = %node.instance,
            upgrade_domain = %node.upgrade_domain,
            version = %node.version_instance,
            "Node up"
        );
        nodes.insert(node.id(), node);
        Ok(())
    }

    fn node_down(&self, node: NodeInstance) -> Result<()> {
        self.commit(node.id, |current| {
            if current.instance.instance_id > node.instance_id || !current.is_up {
                return Ok(None);
            }
            let mut updated = current.clone();
            updated.is_up = false;
            Ok(Some(updated))
        })
    }

    fn deactivate_node(&self, id: NodeId, intent: DeactivationIntent) -> Result<()> {
        self.commit(id, |current| {
            if current.deactivation == Some(intent) {
                return Ok(None);
            }
            let mut updated = current.clone();
            updated.deactivation = Some(intent);
            Ok(Some(updated))
        })?;
        tracing::info!(node = %id, ?intent, "Node deactivation requested");
        Ok(())
    }

    async fn update_version_instance(
        &self,
        node: NodeInstance,
        version: FabricVersionInstance,
    ) -> Result<()> {
        let result = self.commit(node.id, |current| {
            if current.instance.instance_id > node.instance_id {
                return Err(StrataError::stale(format!(
                    "version update from {node} behind {}",
                    current.instance
                )));
            }
            if !current.is_pending_fabric_upgrade && current.version_instance == version {
                return Ok(None);
            }
            let mut updated = current.clone();
            updated.version_instance = version.clone();
            updated.is_pending_fabric_upgrade = false;
            Ok(Some(updated))
        });
        match &result {
            Ok(()) => tracing::debug!(node = %node, version = %version, "Node version updated"),
            Err(error) => tracing::info!(node = %node, error = %error, "Node version update failed"),
        }
        result
    }

    async fn set_pending_fabric_upgrade(&self, node: &NodeInfo, value: bool) -> Result<()> {
        if node.is_pending_fabric_upgrade == value {
            return Ok(());
        }
        self.commit(node.id(), |current| {
            if current.instance.instance_id != node.instance.instance_id {
                return Err(StrataError::stale(format!(
                    "pending flag for {} but cache has {}",
                    node.instance, current.instance
                )));
            }
            if current.is_pending_fabric_upgrade == value {
                return Ok(None);
            }
            let mut updated = current.clone();
            updated.is_pending_fabric_upgrade = value;
            Ok(Some(updated))
        })
    }

    async fn replica_uploaded(&self, node: NodeInstance) -> Result<()> {
        self.commit(node.id, |current| {
            if current.instance.instance_id > node.instance_id || current.is_replica_upload_complete {
                return Ok(None);
            }
            if current.instance.instance_id != node.instance_id {
                return Err(StrataError::stale(format!(
                    "replica upload from {node} but cache has {}",
                    current.instance
                )));
            }
            let mut updated = current.clone();
            updated.is_replica_upload_complete = true;
            Ok(Some(updated))
        })
    }
}
