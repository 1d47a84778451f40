//! Replica report reconciliation
//!
//! A [`ReplicasUpdateOperation`] takes one batch of replica reports from a
//! node and resolves every failover unit in it exactly once: applied,
//! dropped, failed, or timed out. The batch completes once nothing is
//! pending, and completion is posted to the pool exactly once.
//!
//! Every failover unit id goes into the pending set before the first report
//! is processed, so an early resolution can never complete the batch while
//! other reports are still being submitted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use strata_core::{
    FailoverConfig, FailoverUnitId, NodeInstance, Result, SharedRuntime, StrataError, TimerHandle,
};

use crate::failover_unit::FailoverUnit;
use crate::failover_unit_cache::{FailoverUnitCache, FailoverUnitTask};
use crate::messages::{ReplicaInfo, ReplicaUpMessage, ReplicaUpReply};
use crate::node_cache::NodeCache;
use crate::sender::NodeSender;
use crate::service::{InBuildFailoverUnitCache, InBuildOutcome, ServiceLookup};

const MAX_RESUBMITS: usize = 3;

/// Collaborators shared by every replica batch
#[derive(Clone)]
pub struct ReplicaUpdateContext {
    /// Resident failover units
    pub cache: Arc<FailoverUnitCache>,
    /// Service descriptions
    pub services: Arc<dyn ServiceLookup>,
    /// Units being rebuilt
    pub in_build: Arc<dyn InBuildFailoverUnitCache>,
    /// Pool and timers
    pub runtime: SharedRuntime,
    /// Retry tick and batch deadline
    pub config: FailoverConfig,
}

/// How a single report was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaResolution {
    /// Applied to the failover unit
    Processed,
    /// The node should drop the replica
    Dropped,
}

/// Final result of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicasUpdateResult {
    /// First failure, if any
    pub error: Option<StrataError>,
    /// Applied reports
    pub processed: Vec<ReplicaInfo>,
    /// Reports the node should drop
    pub dropped: Vec<ReplicaInfo>,
}

/// Called once a batch resolved
pub trait ReplicasUpdateHandler: Send + Sync {
    /// Runs on the pool, exactly once per batch
    fn on_completed(&self, operation: &Arc<ReplicasUpdateOperation>);
}

#[derive(Default)]
struct OperationState {
    pending: HashSet<FailoverUnitId>,
    processed: Vec<ReplicaInfo>,
    dropped: Vec<ReplicaInfo>,
    retry_list: Vec<(ReplicaInfo, bool)>,
    error: Option<StrataError>,
    timer: Option<TimerHandle>,
    is_completed: bool,
}

/// One batch of replica reports from one node
pub struct ReplicasUpdateOperation {
    from: NodeInstance,
    message: ReplicaUpMessage,
    context: ReplicaUpdateContext,
    started_at: Instant,
    handler: Box<dyn ReplicasUpdateHandler>,
    state: Mutex<OperationState>,
}

impl ReplicasUpdateOperation {
    /// Batch for `message` from `from`; call [`Self::start`] to process it
    pub fn new(
        from: NodeInstance,
        message: ReplicaUpMessage,
        context: ReplicaUpdateContext,
        handler: Box<dyn ReplicasUpdateHandler>,
    ) -> Arc<Self> {
        let started_at = context.runtime.now();
        Arc::new(Self {
            from,
            message,
            context,
            started_at,
            handler,
            state: Mutex::new(OperationState::default()),
        })
    }

    /// Node that sent the batch
    pub fn from(&self) -> NodeInstance {
        self.from
    }

    /// Batch being processed
    pub fn message(&self) -> &ReplicaUpMessage {
        &self.message
    }

    /// Whether the batch resolved
    pub fn is_completed(&self) -> bool {
        self.state.lock().is_completed
    }

    /// Failover units still unresolved
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Accumulated result
    pub fn result(&self) -> ReplicasUpdateResult {
        let state = self.state.lock();
        ReplicasUpdateResult {
            error: state.error.clone(),
            processed: state.processed.clone(),
            dropped: state.dropped.clone(),
        }
    }

    /// Mark every failover unit pending, arm the retry tick, process reports
    pub fn start(self: &Arc<Self>) {
        let reports: Vec<(ReplicaInfo, bool)> = {
            let mut state = self.state.lock();
            let mut reports = Vec::new();
            let live = self.message.replicas.iter().map(|r| (r, false));
            let dropped = self.message.dropped_replicas.iter().map(|r| (r, true));
            for (report, from_dropped_list) in live.chain(dropped) {
                if state.pending.insert(report.failover_unit_id) {
                    reports.push((report.clone(), from_dropped_list));
                } else {
                    tracing::warn!(
                        from = %self.from,
                        failover_unit = %report.failover_unit_id,
                        "Duplicate failover unit in replica batch ignored"
                    );
                }
            }
            reports
        };

        tracing::debug!(
            from = %self.from,
            count = reports.len(),
            is_last = self.message.is_last_replica_up_message,
            "Replica batch started"
        );
        self.arm_timer();

        for (report, from_dropped_list) in reports {
            self.process_replica(report, from_dropped_list);
        }

        let empty = self.state.lock().pending.is_empty();
        if empty {
            self.complete();
        }
    }

    fn arm_timer(self: &Arc<Self>) {
        let operation = Arc::clone(self);
        let handle = self.context.runtime.schedule(
            self.context.config.store_retry_interval(),
            Box::new(move || operation.on_timer()),
        );
        let mut state = self.state.lock();
        if state.is_completed {
            handle.cancel();
        } else {
            state.timer = Some(handle);
        }
    }

    fn on_timer(self: &Arc<Self>) {
        let elapsed = self
            .context
            .runtime
            .now()
            .saturating_duration_since(self.started_at);
        let expired = elapsed >= self.context.config.replica_up_timeout();

        let retries = {
            let mut state = self.state.lock();
            if state.is_completed {
                return;
            }
            state.timer = None;
            if expired {
                let pending = state.pending.len();
                state.pending.clear();
                state.retry_list.clear();
                state.error.get_or_insert_with(|| {
                    StrataError::timeout(format!("{pending} failover units unresolved"))
                });
                None
            } else {
                Some(std::mem::take(&mut state.retry_list))
            }
        };

        match retries {
            None => {
                tracing::info!(from = %self.from, "Replica batch timed out");
                self.complete();
            }
            Some(retries) => {
                self.arm_timer();
                for (report, from_dropped_list) in retries {
                    self.process_replica(report, from_dropped_list);
                }
            }
        }
    }

    fn process_replica(self: &Arc<Self>, report: ReplicaInfo, from_dropped_list: bool) {
        match self.context.services.get_service(&report.service_name) {
            None => {
                tracing::debug!(
                    failover_unit = %report.failover_unit_id,
                    service = %report.service_name,
                    "Replica report for unknown service"
                );
                self.add_result(report, ReplicaResolution::Dropped);
                return;
            }
            Some(service) if report.service_instance < service.instance => {
                self.add_result(report, ReplicaResolution::Dropped);
                return;
            }
            Some(service)
                if report.service_instance == service.instance
                    && report.service_update_version > service.update_version =>
            {
                if let Err(error) = self.context.services.update_service_version(
                    &report.service_name,
                    report.service_instance,
                    report.service_update_version,
                ) {
                    tracing::info!(service = %report.service_name, error = %error, "Service update failed");
                }
            }
            Some(_) => {}
        }

        if from_dropped_list {
            assert!(
                report.is_dropped || !report.is_up,
                "dropped list carries a live replica: {report:?}"
            );
        }

        for _ in 0..MAX_RESUBMITS {
            let task = Box::new(ReplicaUpdateTask {
                operation: Arc::clone(self),
                report: report.clone(),
                from_dropped_list,
                resolution: ReplicaResolution::Processed,
            });
            if self
                .context
                .cache
                .try_process_task_async(report.failover_unit_id, task, self.from, false)
                .is_ok()
            {
                return;
            }
            if !self.process_missing_failover_unit(&report, from_dropped_list) {
                return;
            }
        }
        self.add_retry(report, from_dropped_list);
    }

    /// True when the unit became resident and the report should be resubmitted
    fn process_missing_failover_unit(
        self: &Arc<Self>,
        report: &ReplicaInfo,
        from_dropped_list: bool,
    ) -> bool {
        match self.context.in_build.process_missing(report, self.from) {
            Ok(InBuildOutcome::Absorbed) => {
                self.add_result(report.clone(), ReplicaResolution::Processed);
                false
            }
            Ok(InBuildOutcome::Created) => true,
            Err(StrataError::FailoverUnitAlreadyExists { .. }) => true,
            Ok(InBuildOutcome::NotFound) if report.is_dropped || !report.is_up => {
                self.add_result(report.clone(), ReplicaResolution::Dropped);
                false
            }
            Ok(InBuildOutcome::NotFound) => {
                self.add_retry(report.clone(), from_dropped_list);
                false
            }
            Err(error) => {
                tracing::debug!(
                    failover_unit = %report.failover_unit_id,
                    error = %error,
                    "In-build lookup failed"
                );
                self.add_retry(report.clone(), from_dropped_list);
                false
            }
        }
    }

    /// Resolve one failover unit
    pub fn add_result(self: &Arc<Self>, report: ReplicaInfo, resolution: ReplicaResolution) {
        let done = {
            let mut state = self.state.lock();
            if state.is_completed {
                return;
            }
            assert!(
                state.pending.remove(&report.failover_unit_id),
                "failover unit {} resolved twice",
                report.failover_unit_id
            );
            match resolution {
                ReplicaResolution::Processed => state.processed.push(report),
                ReplicaResolution::Dropped => state.dropped.push(report),
            }
            state.pending.is_empty()
        };
        if done {
            self.complete();
        }
    }

    /// Resolve one failover unit as failed; the batch reply carries `error`
    pub fn add_failure(self: &Arc<Self>, report: &ReplicaInfo, error: StrataError) {
        let done = {
            let mut state = self.state.lock();
            if state.is_completed {
                return;
            }
            assert!(
                state.pending.remove(&report.failover_unit_id),
                "failover unit {} resolved twice",
                report.failover_unit_id
            );
            state.error.get_or_insert(error);
            state.pending.is_empty()
        };
        if done {
            self.complete();
        }
    }

    /// Resubmit the report on the next retry tick
    pub fn add_retry(&self, report: ReplicaInfo, from_dropped_list: bool) {
        let mut state = self.state.lock();
        if !state.is_completed {
            state.retry_list.push((report, from_dropped_list));
        }
    }

    fn complete(self: &Arc<Self>) {
        let timer = {
            let mut state = self.state.lock();
            if state.is_completed {
                return;
            }
            state.is_completed = true;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        tracing::debug!(from = %self.from, "Replica batch completed");
        let operation = Arc::clone(self);
        self.context
            .runtime
            .post(Box::new(move || operation.handler.on_completed(&operation)));
    }
}

/// Applies one replica report to its failover unit
pub struct ReplicaUpdateTask {
    operation: Arc<ReplicasUpdateOperation>,
    report: ReplicaInfo,
    from_dropped_list: bool,
    resolution: ReplicaResolution,
}

impl FailoverUnitTask for ReplicaUpdateTask {
    fn check_failover_unit(&mut self, unit: &mut FailoverUnit) -> bool {
        if self.report.service_instance < unit.service_instance {
            self.resolution = ReplicaResolution::Dropped;
            return false;
        }
        if self.report.is_dropped {
            self.resolution = ReplicaResolution::Dropped;
        }
        let now = self.operation.context.runtime.now();
        unit.apply_replica_report(&self.report, now)
    }

    fn on_committed(self: Box<Self>, result: Result<()>) {
        let Self {
            operation,
            report,
            from_dropped_list,
            resolution,
        } = *self;
        match result {
            Ok(()) => operation.add_result(report, resolution),
            Err(error) if error.is_transient() => operation.add_retry(report, from_dropped_list),
            Err(error) => operation.add_failure(&report, error),
        }
    }
}

/// Replies to a node's replica up batch
pub struct ReplicaUpProcessingOperation {
    nodes: Arc<dyn NodeCache>,
    sender: Arc<dyn NodeSender>,
    runtime: SharedRuntime,
}

impl ReplicaUpProcessingOperation {
    /// Start processing `message` from `from`
    pub fn start(
        from: NodeInstance,
        message: ReplicaUpMessage,
        context: ReplicaUpdateContext,
        nodes: Arc<dyn NodeCache>,
        sender: Arc<dyn NodeSender>,
    ) -> Arc<ReplicasUpdateOperation> {
        let handler = Self {
            nodes,
            sender,
            runtime: Arc::clone(&context.runtime),
        };
        let operation = ReplicasUpdateOperation::new(from, message, context, Box::new(handler));
        operation.start();
        operation
    }

    fn reply(
        sender: &dyn NodeSender,
        to: NodeInstance,
        result: ReplicasUpdateResult,
        error: Option<StrataError>,
        is_last: bool,
    ) {
        let reply = ReplicaUpReply {
            error: error.map_or(strata_core::ErrorCodeValue::Success, |e| e.code()),
            processed: result.processed,
            dropped: result.dropped,
            is_last_replica_up_message: is_last,
        };
        tracing::debug!(
            to = %to,
            error = ?reply.error,
            processed = reply.processed.len(),
            dropped = reply.dropped.len(),
            "Replica up reply"
        );
        sender.send_replica_up_reply(to, reply);
    }
}

impl ReplicasUpdateHandler for ReplicaUpProcessingOperation {
    fn on_completed(&self, operation: &Arc<ReplicasUpdateOperation>) {
        let from = operation.from();
        let mut result = operation.result();
        let is_last = operation.message().is_last_replica_up_message;

        if let Some(error) = result.error.take() {
            Self::reply(self.sender.as_ref(), from, result, Some(error), is_last);
            return;
        }
        if !is_last {
            Self::reply(self.sender.as_ref(), from, result, None, false);
            return;
        }

        let nodes = Arc::clone(&self.nodes);
        let sender = Arc::clone(&self.sender);
        self.runtime.spawn(Box::pin(async move {
            let uploaded = nodes.replica_uploaded(from).await;
            Self::reply(sender.as_ref(), from, result, uploaded.err(), true);
        }));
    }
}
