//! Generic upgrade state machine
//!
//! Walks the state graph of an [`Upgrade`] strategy one state at a time.
//!
//! # Architecture
//!
//! - **Timer states** arm a one-shot timer; when it fires the machine moves to
//!   the state's target
//! - **Async API states** hand an [`AsyncOperation`] to the strategy; a
//!   synchronous completion continues on the current thread, otherwise the
//!   operation's callback continues later
//! - **Normal states** run synchronously and either return the next state or
//!   finish through a [`StateCompletion`]; whichever arrives first drives the
//!   machine and the other is rejected
//!
//! Transitions happen under one lock. Anything that can call back into the
//! machine (cancelling a timer or operation, invoking a cancel callback,
//! calling the strategy) happens after the lock is released.
//!
//! Cancellation is cooperative: the current state's [`CancelBehaviorType`]
//! decides whether a request closes the machine now, closes it once the state
//! finishes, or is refused.
//!
//! [`CancelBehaviorType`]: crate::state::CancelBehaviorType

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_core::{SharedRuntime, TimerHandle};

use crate::async_op::AsyncOperation;
use crate::state::{
    decide_cancel_action, CancelAction, LifeCycleState, RollbackSnapshot, UpgradeCancelMode,
    UpgradeCancelResult, UpgradeStateKind, UpgradeStateName,
};
use crate::upgrade::Upgrade;

/// Callback run once a deferred rollback closes the machine
pub type CancelCompletion = Box<dyn FnOnce(Arc<UpgradeStateMachine>) + Send>;

struct ArmedTimer {
    handle: TimerHandle,
    target: UpgradeStateName,
}

struct MachineState {
    current: UpgradeStateName,
    life_cycle: LifeCycleState,
    async_op: Option<AsyncOperation>,
    timer: Option<ArmedTimer>,
    cancel_callback: Option<CancelCompletion>,
    normal_entries: u64,
    outstanding_completion: Option<u64>,
}

enum Step {
    Stop,
    Cancelled(Option<CancelCompletion>),
    Enter,
}

/// Continuation handed to a normal state
pub struct StateCompletion {
    machine: Arc<UpgradeStateMachine>,
    entry: u64,
}

impl StateCompletion {
    /// Move the machine to `next`
    ///
    /// Ignored when the state already returned its next state.
    pub fn complete(self, next: UpgradeStateName) {
        if self.machine.claim_normal_completion(self.entry) {
            self.machine.process_next_state(next);
        } else {
            tracing::error!(
                activity_id = self.machine.upgrade.activity_id(),
                next_state = %next,
                "Normal state completed after it already moved on"
            );
        }
    }

    /// Machine this continuation drives
    pub fn machine(&self) -> &Arc<UpgradeStateMachine> {
        &self.machine
    }
}

/// Drives one upgrade attempt on this node
pub struct UpgradeStateMachine {
    upgrade: Box<dyn Upgrade>,
    runtime: SharedRuntime,
    state: Mutex<MachineState>,
}

impl UpgradeStateMachine {
    /// Create an unstarted machine owning `upgrade`
    pub fn create(upgrade: Box<dyn Upgrade>, runtime: SharedRuntime) -> Arc<Self> {
        Arc::new(Self {
            upgrade,
            runtime,
            state: Mutex::new(MachineState {
                current: UpgradeStateName::None,
                life_cycle: LifeCycleState::Open,
                async_op: None,
                timer: None,
                cancel_callback: None,
                normal_entries: 0,
                outstanding_completion: None,
            }),
        })
    }

    /// Strategy driven by this machine
    pub fn upgrade(&self) -> &dyn Upgrade {
        self.upgrade.as_ref()
    }

    /// Current state
    pub fn current_state(&self) -> UpgradeStateName {
        self.state.lock().current
    }

    /// Current life cycle
    pub fn life_cycle(&self) -> LifeCycleState {
        self.state.lock().life_cycle
    }

    /// Whether no further transitions will happen
    pub fn is_closed(&self) -> bool {
        self.life_cycle() == LifeCycleState::Closed
    }

    /// Whether the upgrade ran to completion and the machine is still open
    pub fn is_completed(&self) -> bool {
        let state = self.state.lock();
        state.current == UpgradeStateName::Completed && state.life_cycle != LifeCycleState::Closed
    }

    /// Whether a retry timer is armed
    pub fn has_timer(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// In-flight async operation, if any
    pub fn async_operation(&self) -> Option<AsyncOperation> {
        self.state.lock().async_op.clone()
    }

    /// Begin driving from the strategy's start state
    ///
    /// A machine closed before it started stays in [`UpgradeStateName::None`].
    pub fn start(self: &Arc<Self>, rollback: Option<RollbackSnapshot>) {
        {
            let state = self.state.lock();
            if state.life_cycle == LifeCycleState::Closed {
                tracing::debug!(
                    activity_id = self.upgrade.activity_id(),
                    "Upgrade state machine closed before start"
                );
                return;
            }
            assert_eq!(
                state.current,
                UpgradeStateName::None,
                "upgrade state machine started twice"
            );
        }

        let start = self.upgrade.get_start_state(rollback.as_ref());
        assert!(start.is_startable(), "invalid start state {start}");
        tracing::info!(
            activity_id = self.upgrade.activity_id(),
            instance_id = self.upgrade.instance_id(),
            start = %start,
            rollback = ?rollback.map(|r| r.state()),
            "Upgrade state machine starting"
        );
        self.process_next_state(start);
    }

    pub(crate) fn process_next_state(self: &Arc<Self>, next: UpgradeStateName) {
        let mut next = next;
        loop {
            assert!(
                next != UpgradeStateName::Invalid && next != UpgradeStateName::None,
                "strategy produced {next} as a next state"
            );

            let step = {
                let mut state = self.state.lock();
                match state.life_cycle {
                    LifeCycleState::Closed => Step::Stop,
                    LifeCycleState::Cancelling => {
                        state.life_cycle = LifeCycleState::Closed;
                        Step::Cancelled(state.cancel_callback.take())
                    }
                    LifeCycleState::Open => {
                        tracing::debug!(
                            activity_id = self.upgrade.activity_id(),
                            current = %state.current,
                            next_state = %next,
                            "Upgrade state machine entering state"
                        );
                        state.current = next;
                        if next == UpgradeStateName::Completed {
                            Step::Stop
                        } else {
                            Step::Enter
                        }
                    }
                }
            };

            match step {
                Step::Stop => return,
                Step::Cancelled(callback) => {
                    tracing::info!(
                        activity_id = self.upgrade.activity_id(),
                        "Deferred rollback honored"
                    );
                    if let Some(callback) = callback {
                        callback(Arc::clone(self));
                    }
                    return;
                }
                Step::Enter => {}
            }

            next = self.enter_state(next);
            if next == UpgradeStateName::Invalid {
                return;
            }
        }
    }

    fn enter_state(self: &Arc<Self>, name: UpgradeStateName) -> UpgradeStateName {
        let description = self.upgrade.state_description(name);
        match description.kind {
            UpgradeStateKind::Timer {
                retry_interval,
                target,
            } => {
                self.arm_timer(name, retry_interval, target);
                UpgradeStateName::Invalid
            }
            UpgradeStateKind::AsyncApi => self.enter_async_api_state(name),
            UpgradeStateKind::Normal => self.enter_normal_state(name),
        }
    }

    fn enter_normal_state(self: &Arc<Self>, name: UpgradeStateName) -> UpgradeStateName {
        let entry = {
            let mut state = self.state.lock();
            state.normal_entries += 1;
            state.outstanding_completion = Some(state.normal_entries);
            state.normal_entries
        };
        let completion = StateCompletion {
            machine: Arc::clone(self),
            entry,
        };

        let next = self.upgrade.enter_state(name, completion);
        if next == UpgradeStateName::Invalid || self.claim_normal_completion(entry) {
            return next;
        }
        tracing::error!(
            activity_id = self.upgrade.activity_id(),
            state = %name,
            next_state = %next,
            "Normal state returned a next state after completing"
        );
        UpgradeStateName::Invalid
    }

    fn claim_normal_completion(&self, entry: u64) -> bool {
        let mut state = self.state.lock();
        if state.outstanding_completion == Some(entry) {
            state.outstanding_completion = None;
            true
        } else {
            false
        }
    }

    fn arm_timer(self: &Arc<Self>, name: UpgradeStateName, delay: Duration, target: UpgradeStateName) {
        let mut state = self.state.lock();
        if state.life_cycle == LifeCycleState::Closed {
            return;
        }
        assert!(
            state.timer.is_none() && state.async_op.is_none(),
            "timer state {name} entered while another drive is in flight"
        );
        let machine = Arc::clone(self);
        let handle = self
            .runtime
            .schedule(delay, Box::new(move || machine.on_timer()));
        state.timer = Some(ArmedTimer { handle, target });
    }

    /// Retry timer callback: move to the timer state's target
    pub fn on_timer(self: &Arc<Self>) {
        let target = {
            let mut state = self.state.lock();
            if state.life_cycle == LifeCycleState::Closed {
                return;
            }
            match state.timer.take() {
                Some(timer) => {
                    tracing::debug!(
                        activity_id = self.upgrade.activity_id(),
                        current = %state.current,
                        next_state = %timer.target,
                        "Upgrade state machine timer fired"
                    );
                    timer.target
                }
                None => return,
            }
        };
        self.process_next_state(target);
    }

    fn enter_async_api_state(self: &Arc<Self>, name: UpgradeStateName) -> UpgradeStateName {
        let machine = Arc::clone(self);
        let operation = AsyncOperation::new(Box::new(move |op: &AsyncOperation| {
            machine.on_async_operation_completed(name, op);
        }));

        self.upgrade
            .enter_async_operation_state(name, operation.clone());

        let mut cancel_now = false;
        let completed_synchronously = {
            let mut state = self.state.lock();
            if operation.finish_start() {
                true
            } else {
                if state.life_cycle == LifeCycleState::Closed {
                    cancel_now = true;
                } else {
                    assert!(
                        state.async_op.is_none() && state.timer.is_none(),
                        "async state {name} entered while another drive is in flight"
                    );
                    state.async_op = Some(operation.clone());
                }
                false
            }
        };

        tracing::debug!(
            activity_id = self.upgrade.activity_id(),
            state = %name,
            operation = operation.id(),
            completed_synchronously,
            "Upgrade async operation started"
        );

        if completed_synchronously {
            return self.upgrade.exit_async_operation_state(name, &operation);
        }
        if cancel_now {
            operation.cancel();
        }
        UpgradeStateName::Invalid
    }

    fn on_async_operation_completed(self: &Arc<Self>, name: UpgradeStateName, op: &AsyncOperation) {
        {
            let mut state = self.state.lock();
            if state.async_op.as_ref().is_some_and(|current| current.ptr_eq(op)) {
                state.async_op = None;
            }
        }
        tracing::debug!(
            activity_id = self.upgrade.activity_id(),
            state = %name,
            operation = op.id(),
            outcome = ?op.outcome(),
            "Upgrade async operation completed"
        );
        let next = self.upgrade.exit_async_operation_state(name, op);
        if next != UpgradeStateName::Invalid {
            self.process_next_state(next);
        }
    }

    /// Ask the machine to stop
    ///
    /// `callback` runs only for a [`UpgradeCancelResult::Queued`] result, once
    /// the current state finishes.
    pub fn try_cancel_upgrade<F>(self: &Arc<Self>, mode: UpgradeCancelMode, callback: F) -> UpgradeCancelResult
    where
        F: FnOnce(Arc<UpgradeStateMachine>) + Send + 'static,
    {
        let (timer, operation) = {
            let mut state = self.state.lock();
            if state.life_cycle == LifeCycleState::Closed
                || state.current == UpgradeStateName::Completed
            {
                return UpgradeCancelResult::Success;
            }
            if state.current == UpgradeStateName::None {
                state.life_cycle = LifeCycleState::Closed;
                return UpgradeCancelResult::Success;
            }
            if state.life_cycle == LifeCycleState::Cancelling {
                return UpgradeCancelResult::NotAllowed;
            }

            let behavior = self.upgrade.state_description(state.current).cancel_behavior;
            let action = decide_cancel_action(mode, behavior);
            tracing::info!(
                activity_id = self.upgrade.activity_id(),
                state = %state.current,
                ?mode,
                ?behavior,
                ?action,
                "Upgrade cancel requested"
            );
            match action {
                CancelAction::NotAllowed => return UpgradeCancelResult::NotAllowed,
                CancelAction::Deferred => {
                    state.life_cycle = LifeCycleState::Cancelling;
                    state.cancel_callback = Some(Box::new(callback));
                    return UpgradeCancelResult::Queued;
                }
                CancelAction::Immediate => {
                    state.life_cycle = LifeCycleState::Closed;
                    (state.timer.take(), state.async_op.take())
                }
            }
        };

        if let Some(timer) = timer {
            timer.handle.cancel();
        }
        if let Some(operation) = operation {
            operation.cancel();
        }
        UpgradeCancelResult::Success
    }

    /// Tear down unconditionally
    pub fn close(&self) {
        let (timer, operation, callback) = {
            let mut state = self.state.lock();
            state.life_cycle = LifeCycleState::Closed;
            (
                state.timer.take(),
                state.async_op.take(),
                state.cancel_callback.take(),
            )
        };
        drop(callback);
        if let Some(timer) = timer {
            timer.handle.cancel();
        }
        if let Some(operation) = operation {
            operation.cancel();
        }
        tracing::debug!(
            activity_id = self.upgrade.activity_id(),
            "Upgrade state machine closed"
        );
    }

    /// Snapshot for a successor machine; the machine must be closed
    pub fn create_rollback_snapshot(&self) -> RollbackSnapshot {
        let current = {
            let state = self.state.lock();
            assert_eq!(
                state.life_cycle,
                LifeCycleState::Closed,
                "rollback snapshot of an open upgrade state machine"
            );
            state.current
        };
        self.upgrade.create_rollback_snapshot(current)
    }

    /// Re-send the completion reply
    pub fn send_reply(&self) {
        self.upgrade.send_reply();
    }
}

impl fmt::Debug for UpgradeStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UpgradeStateMachine")
            .field("activity_id", &self.upgrade.activity_id())
            .field("current", &state.current)
            .field("life_cycle", &state.life_cycle)
            .field("timer", &state.timer.is_some())
            .field("async_op", &state.async_op)
            .finish()
    }
}
