//! Failover unit model and its health classification

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strata_core::{FailoverConfig, FailoverUnitId, NodeInstance};

use crate::messages::ReplicaInfo;

/// Life cycle of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Being built from the primary
    InBuild,
    /// Serving
    Ready,
    /// Not running, may come back
    Down,
    /// Gone for good
    Dropped,
}

/// Replica of a failover unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Hosting node incarnation
    pub node: NodeInstance,
    /// Replica identity
    pub replica_id: u64,
    /// Current state
    pub state: ReplicaState,
}

impl Replica {
    /// Whether the replica serves traffic
    pub fn is_available(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    /// Whether the replica still counts towards the configuration
    pub fn is_in_configuration(&self) -> bool {
        self.state != ReplicaState::Dropped
    }
}

/// Health classification of a failover unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverUnitHealthState {
    /// Nothing to report
    Healthy,
    /// Replicas missing, placement in progress
    Placement,
    /// A replica is being built
    Build,
    /// Reconfiguration in progress
    Reconfiguration,
    /// Fewer replicas up than the write quorum
    QuorumLost,
    /// Reconfiguration exceeded its time limit
    ReconfigurationStuck,
    /// Placement exceeded its time limit
    PlacementStuck,
    /// Placement stuck with fewer replicas than the minimum
    PlacementStuckBelowMinReplicaCount,
    /// Placement stuck with no replica available
    PlacementStuckAtZeroReplicaCount,
    /// Being deleted
    DeletionInProgress,
}

impl FailoverUnitHealthState {
    /// Collapses transient progress states into [`Self::Healthy`]
    pub fn effective(self) -> Self {
        match self {
            Self::Placement | Self::Build | Self::Reconfiguration => Self::Healthy,
            other => other,
        }
    }
}

/// Replica set of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverUnit {
    /// Identity
    pub id: FailoverUnitId,
    /// Owning service
    pub service_name: String,
    /// Incarnation of the service description
    pub service_instance: u64,
    /// Whether replicas keep state
    pub is_stateful: bool,
    /// Desired replica count
    pub target_replica_set_size: usize,
    /// Minimum replica count for writes
    pub min_replica_set_size: usize,
    /// Replicas, live and dropped
    pub replicas: Vec<Replica>,
    /// Whether the unit is being deleted
    pub is_to_be_deleted: bool,
    /// When the running reconfiguration started
    pub reconfiguration_started_at: Option<Instant>,
    /// When the unit first fell below its target size
    pub placement_started_at: Option<Instant>,
}

impl FailoverUnit {
    /// Stateful unit with no replicas yet
    pub fn stateful(
        id: FailoverUnitId,
        service_name: impl Into<String>,
        service_instance: u64,
        target_replica_set_size: usize,
        min_replica_set_size: usize,
    ) -> Self {
        Self {
            id,
            service_name: service_name.into(),
            service_instance,
            is_stateful: true,
            target_replica_set_size,
            min_replica_set_size,
            replicas: Vec::new(),
            is_to_be_deleted: false,
            reconfiguration_started_at: None,
            placement_started_at: None,
        }
    }

    /// Stateless unit with no instances yet
    pub fn stateless(
        id: FailoverUnitId,
        service_name: impl Into<String>,
        service_instance: u64,
        instance_count: usize,
    ) -> Self {
        Self {
            is_stateful: false,
            ..Self::stateful(id, service_name, service_instance, instance_count, 1)
        }
    }

    /// Replicas serving traffic
    pub fn available_replica_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_available()).count()
    }

    fn configuration_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_in_configuration()).count()
    }

    fn write_quorum(&self) -> usize {
        self.configuration_count() / 2 + 1
    }

    /// Whether a stateful unit lost its write quorum
    pub fn is_quorum_lost(&self) -> bool {
        self.is_stateful
            && self.configuration_count() > 0
            && self.available_replica_count() < self.write_quorum()
    }

    /// Apply a replica report from a node; true when the unit changed
    pub fn apply_replica_report(&mut self, report: &ReplicaInfo, now: Instant) -> bool {
        let state = if report.is_dropped {
            ReplicaState::Dropped
        } else if report.is_up {
            ReplicaState::Ready
        } else {
            ReplicaState::Down
        };

        let existing = self
            .replicas
            .iter_mut()
            .find(|r| r.node.id == report.node.id && r.replica_id == report.replica_id);
        let changed = match existing {
            Some(replica) => {
                let changed = replica.state != state || replica.node != report.node;
                replica.state = state;
                replica.node = report.node;
                changed
            }
            None if state == ReplicaState::Dropped => false,
            None => {
                self.replicas.push(Replica {
                    node: report.node,
                    replica_id: report.replica_id,
                    state,
                });
                true
            }
        };

        if changed {
            self.update_placement_clock(now);
        }
        changed
    }

    fn update_placement_clock(&mut self, now: Instant) {
        if self.available_replica_count() < self.target_replica_set_size {
            self.placement_started_at.get_or_insert(now);
        } else {
            self.placement_started_at = None;
        }
    }

    /// Current health and, for unhealthy states, a replica listing
    pub fn current_health(
        &self,
        now: Instant,
        config: &FailoverConfig,
    ) -> (FailoverUnitHealthState, String) {
        use FailoverUnitHealthState::*;
        if self.is_to_be_deleted {
            return (DeletionInProgress, String::new());
        }

        let elapsed = |since: Instant| now.saturating_duration_since(since);
        let available = self.available_replica_count();
        let mut result = Healthy;

        if self.is_stateful {
            if self.is_quorum_lost() {
                return (QuorumLost, self.detailed_description(config));
            }
            if let Some(started) = self.reconfiguration_started_at {
                if elapsed(started) > config.reconfiguration_time_limit() {
                    return (ReconfigurationStuck, self.detailed_description(config));
                }
                result = Reconfiguration;
            } else if available < self.target_replica_set_size {
                result = Placement;
            } else if self.replicas.iter().any(|r| r.state == ReplicaState::InBuild) {
                result = Build;
            }
        } else if available == 0 || available < self.target_replica_set_size {
            result = Placement;
        }

        let placement_elapsed = self.placement_started_at.map_or(Duration::ZERO, elapsed);
        if result == Placement && placement_elapsed > config.placement_time_limit() {
            let state = if self.is_stateful {
                if available < self.min_replica_set_size {
                    PlacementStuckBelowMinReplicaCount
                } else {
                    PlacementStuck
                }
            } else if available == 0 {
                PlacementStuckAtZeroReplicaCount
            } else {
                PlacementStuck
            };
            return (state, self.detailed_description(config));
        }

        (result, String::new())
    }

    fn detailed_description(&self, config: &FailoverConfig) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} {} {}",
            self.service_name, self.target_replica_set_size, self.min_replica_set_size, self.id
        );

        if self.is_stateful {
            for replica in self.replicas.iter().filter(|r| r.is_in_configuration()) {
                let _ = writeln!(out, "  {:?} {} {}", replica.state, replica.node, replica.replica_id);
            }
            return out;
        }

        // Unavailable instances first, then available ones, up to the cap.
        let cap = config.max_replicas_in_health_report_description;
        let live: Vec<&Replica> = self.replicas.iter().filter(|r| r.is_in_configuration()).collect();
        let (available, unavailable): (Vec<&Replica>, Vec<&Replica>) =
            live.iter().copied().partition(|r| r.is_available());
        let mut written = 0;
        for replica in unavailable.iter().chain(available.iter()).take(cap) {
            let _ = writeln!(out, "  {:?} {} {}", replica.state, replica.node, replica.replica_id);
            written += 1;
        }
        let _ = writeln!(
            out,
            "  (Showing {written} out of {} instances. Total available instances: {})",
            live.len(),
            available.len()
        );
        out
    }
}
