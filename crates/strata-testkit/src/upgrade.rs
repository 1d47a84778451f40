//! Scripted [`Upgrade`] strategy
//!
//! Each state is declared up front. Normal and async states either finish on
//! the spot or park their continuation in a [`ScriptLog`] so a test decides
//! when, and how, they finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_core::Result;
use strata_reconfig::{
    AsyncOperation, CancelBehaviorType, RollbackSnapshot, StateCompletion, Upgrade,
    UpgradeStateDescription, UpgradeStateName,
};

#[derive(Clone)]
struct ScriptedState {
    description: UpgradeStateDescription,
    next: UpgradeStateName,
    on_failure: UpgradeStateName,
    immediate: Option<Result<()>>,
}

/// What the scripted strategy was asked to do
#[derive(Default)]
pub struct ScriptLog {
    entered: Mutex<Vec<UpgradeStateName>>,
    completions: Mutex<Vec<StateCompletion>>,
    operations: Mutex<Vec<AsyncOperation>>,
    rollback: Mutex<Option<RollbackSnapshot>>,
    replies: Mutex<usize>,
}

impl ScriptLog {
    /// States entered, in order
    pub fn entered(&self) -> Vec<UpgradeStateName> {
        self.entered.lock().clone()
    }

    /// Oldest parked normal state continuation
    pub fn take_completion(&self) -> Option<StateCompletion> {
        let mut completions = self.completions.lock();
        (!completions.is_empty()).then(|| completions.remove(0))
    }

    /// Oldest parked async operation
    pub fn take_operation(&self) -> Option<AsyncOperation> {
        let mut operations = self.operations.lock();
        (!operations.is_empty()).then(|| operations.remove(0))
    }

    /// Snapshot the strategy started from
    pub fn rollback(&self) -> Option<RollbackSnapshot> {
        *self.rollback.lock()
    }

    /// Replies sent to the failover manager
    pub fn replies(&self) -> usize {
        *self.replies.lock()
    }
}

/// Strategy following a declared state graph
pub struct ScriptedUpgrade {
    activity_id: String,
    instance_id: u64,
    start: Option<UpgradeStateName>,
    states: HashMap<UpgradeStateName, ScriptedState>,
    log: Arc<ScriptLog>,
}

impl ScriptedUpgrade {
    /// Empty script for upgrade attempt `instance_id`
    pub fn new(activity_id: impl Into<String>, instance_id: u64) -> Self {
        Self {
            activity_id: activity_id.into(),
            instance_id,
            start: None,
            states: HashMap::new(),
            log: Arc::new(ScriptLog::default()),
        }
    }

    /// Log shared with the test
    pub fn log(&self) -> Arc<ScriptLog> {
        Arc::clone(&self.log)
    }

    fn add(
        mut self,
        description: UpgradeStateDescription,
        next: UpgradeStateName,
        on_failure: UpgradeStateName,
        immediate: Option<Result<()>>,
    ) -> Self {
        self.start.get_or_insert(description.name);
        self.states.insert(
            description.name,
            ScriptedState {
                description,
                next,
                on_failure,
                immediate,
            },
        );
        self
    }

    /// Normal state whose continuation is parked until the test completes it
    pub fn parked(self, name: UpgradeStateName, behavior: CancelBehaviorType) -> Self {
        self.add(
            UpgradeStateDescription::normal(name, behavior),
            UpgradeStateName::Invalid,
            UpgradeStateName::Invalid,
            None,
        )
    }

    /// Normal state returning `next` right away
    pub fn step(self, name: UpgradeStateName, behavior: CancelBehaviorType, next: UpgradeStateName) -> Self {
        self.add(
            UpgradeStateDescription::normal(name, behavior),
            next,
            UpgradeStateName::Invalid,
            Some(Ok(())),
        )
    }

    /// Async state whose operation is parked until the test resolves it
    pub fn awaiting(
        self,
        name: UpgradeStateName,
        behavior: CancelBehaviorType,
        next: UpgradeStateName,
        on_failure: UpgradeStateName,
    ) -> Self {
        self.add(
            UpgradeStateDescription::async_api(name, behavior),
            next,
            on_failure,
            None,
        )
    }

    /// Async state resolving with `result` before its starter returns
    pub fn resolved(
        self,
        name: UpgradeStateName,
        behavior: CancelBehaviorType,
        result: Result<()>,
        next: UpgradeStateName,
        on_failure: UpgradeStateName,
    ) -> Self {
        self.add(
            UpgradeStateDescription::async_api(name, behavior),
            next,
            on_failure,
            Some(result),
        )
    }

    /// Timer state
    pub fn timer(
        self,
        name: UpgradeStateName,
        behavior: CancelBehaviorType,
        interval: Duration,
        target: UpgradeStateName,
    ) -> Self {
        self.add(
            UpgradeStateDescription::timer(name, interval, target, behavior),
            target,
            UpgradeStateName::Invalid,
            None,
        )
    }

    fn state(&self, name: UpgradeStateName) -> &ScriptedState {
        self.states
            .get(&name)
            .unwrap_or_else(|| panic!("script has no state {name}"))
    }

    fn leave(&self, next: UpgradeStateName) -> UpgradeStateName {
        if next == UpgradeStateName::Completed {
            self.send_reply();
        }
        next
    }
}

impl Upgrade for ScriptedUpgrade {
    fn activity_id(&self) -> &str {
        &self.activity_id
    }

    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn get_start_state(&self, rollback: Option<&RollbackSnapshot>) -> UpgradeStateName {
        *self.log.rollback.lock() = rollback.copied();
        self.start.expect("script declares no states")
    }

    fn state_description(&self, state: UpgradeStateName) -> UpgradeStateDescription {
        self.state(state).description
    }

    fn enter_state(&self, state: UpgradeStateName, completion: StateCompletion) -> UpgradeStateName {
        self.log.entered.lock().push(state);
        let scripted = self.state(state);
        if scripted.immediate.is_some() {
            return self.leave(scripted.next);
        }
        self.log.completions.lock().push(completion);
        UpgradeStateName::Invalid
    }

    fn enter_async_operation_state(&self, state: UpgradeStateName, operation: AsyncOperation) {
        self.log.entered.lock().push(state);
        match self.state(state).immediate.clone() {
            Some(result) => {
                operation.complete(result);
            }
            None => self.log.operations.lock().push(operation),
        }
    }

    fn exit_async_operation_state(
        &self,
        state: UpgradeStateName,
        operation: &AsyncOperation,
    ) -> UpgradeStateName {
        let scripted = self.state(state);
        match operation.outcome() {
            Some(Ok(())) => self.leave(scripted.next),
            _ => scripted.on_failure,
        }
    }

    fn create_rollback_snapshot(&self, state: UpgradeStateName) -> RollbackSnapshot {
        RollbackSnapshot::new(state)
    }

    fn send_reply(&self) {
        *self.log.replies.lock() += 1;
    }
}
