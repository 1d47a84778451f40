//! Upgrade state machine driving and cooperative cancellation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use parking_lot::Mutex;
use strata_core::StrataError;
use strata_reconfig::{
    AsyncOperation, CancelBehaviorType, LifeCycleState, RollbackSnapshot, StateCompletion, Upgrade,
    UpgradeCancelMode, UpgradeCancelResult, UpgradeStateDescription, UpgradeStateMachine,
    UpgradeStateName,
};
use strata_testkit::{init_tracing, ManualRuntime, ScriptLog, ScriptedUpgrade};

use CancelBehaviorType::*;
use UpgradeStateName::{Completed, Stage1, Stage2};

fn machine(
    runtime: &Arc<ManualRuntime>,
    script: ScriptedUpgrade,
) -> (Arc<UpgradeStateMachine>, Arc<ScriptLog>) {
    let log = script.log();
    let machine = UpgradeStateMachine::create(Box::new(script), runtime.shared());
    (machine, log)
}

fn awaiting(behavior: CancelBehaviorType) -> ScriptedUpgrade {
    ScriptedUpgrade::new("act", 1)
        .awaiting(Stage1, behavior, Stage2, Stage1)
        .parked(Stage2, CancellableWithImmediateRollback)
}

fn counter() -> (Arc<AtomicUsize>, impl FnOnce(Arc<UpgradeStateMachine>) + Send + 'static) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    (calls, move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn synchronous_completion_continues_on_the_starting_thread() {
    init_tracing();
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1).resolved(
        Stage1,
        CancellableWithImmediateRollback,
        Ok(()),
        Completed,
        Stage1,
    );
    let (machine, log) = machine(&runtime, script);

    machine.start(None);

    assert!(machine.is_completed());
    assert!(machine.async_operation().is_none());
    assert_eq!(log.replies(), 1);
    assert_eq!(runtime.pending_futures(), 0);
}

#[test]
fn asynchronous_completion_moves_to_next_state() {
    let runtime = ManualRuntime::new();
    let (machine, log) = machine(&runtime, awaiting(CancellableWithImmediateRollback));

    machine.start(None);
    assert_eq!(machine.current_state(), Stage1);
    let operation = machine.async_operation().expect("operation in flight");

    assert!(log.take_operation().unwrap().complete(Ok(())));
    assert!(operation.is_completed());
    assert_eq!(machine.current_state(), Stage2);
    assert!(machine.async_operation().is_none());

    log.take_completion().unwrap().complete(Completed);
    assert!(machine.is_completed());
}

#[test]
fn failed_operation_takes_failure_edge() {
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1)
        .resolved(
            Stage1,
            CancellableWithImmediateRollback,
            Err(StrataError::timeout("download")),
            Completed,
            Stage2,
        )
        .parked(Stage2, CancellableWithImmediateRollback);
    let (machine, log) = machine(&runtime, script);

    machine.start(None);

    assert_eq!(machine.current_state(), Stage2);
    assert_eq!(log.entered(), vec![Stage1, Stage2]);
}

#[test]
fn timer_state_moves_to_target_when_it_fires() {
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1)
        .timer(Stage1, CancellableWithImmediateRollback, Duration::from_secs(5), Stage2)
        .parked(Stage2, CancellableWithImmediateRollback);
    let (machine, log) = machine(&runtime, script);

    machine.start(None);
    assert!(machine.has_timer());

    runtime.advance(Duration::from_secs(4));
    assert_eq!(machine.current_state(), Stage1);

    runtime.advance(Duration::from_secs(1));
    assert_eq!(machine.current_state(), Stage2);
    assert!(!machine.has_timer());
    assert_eq!(log.entered(), vec![Stage2]);
}

#[test]
fn cancel_is_refused_by_non_cancellable_states() {
    let runtime = ManualRuntime::new();
    for behavior in [
        NonCancellableWithDeferredRollback,
        NonCancellableWithImmediateRollback,
        NonCancellableWithNoRollback,
    ] {
        let (machine, log) = machine(&runtime, awaiting(behavior));
        machine.start(None);

        let (calls, callback) = counter();
        let result = machine.try_cancel_upgrade(UpgradeCancelMode::Cancel, callback);

        assert_eq!(result, UpgradeCancelResult::NotAllowed, "{behavior:?}");
        assert_eq!(machine.current_state(), Stage1);
        assert_eq!(machine.life_cycle(), LifeCycleState::Open);
        assert!(!log.take_operation().unwrap().is_cancel_requested());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn rollback_is_refused_only_without_rollback() {
    let runtime = ManualRuntime::new();
    let (machine, _log) = machine(&runtime, awaiting(NonCancellableWithNoRollback));
    machine.start(None);

    let result = machine.try_cancel_upgrade(UpgradeCancelMode::Rollback, |_| {});

    assert_eq!(result, UpgradeCancelResult::NotAllowed);
    assert_eq!(machine.life_cycle(), LifeCycleState::Open);
}

#[test]
fn immediate_cancel_stops_the_operation() {
    let runtime = ManualRuntime::new();
    let (machine, log) = machine(&runtime, awaiting(CancellableWithImmediateRollback));
    machine.start(None);
    let operation = log.take_operation().unwrap();

    let result = machine.try_cancel_upgrade(UpgradeCancelMode::Cancel, |_| {});

    assert_eq!(result, UpgradeCancelResult::Success);
    assert!(machine.is_closed());
    assert!(operation.is_cancel_requested());
    assert_matches!(operation.outcome(), Some(Err(StrataError::OperationCanceled { .. })));
    assert!(!operation.complete(Ok(())));
    assert_eq!(machine.current_state(), Stage1);
    assert!(log.take_completion().is_none());
}

#[test]
fn immediate_rollback_disarms_the_timer() {
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1)
        .timer(Stage1, NonCancellableWithImmediateRollback, Duration::from_secs(5), Stage2)
        .parked(Stage2, CancellableWithImmediateRollback);
    let (machine, log) = machine(&runtime, script);
    machine.start(None);

    let result = machine.try_cancel_upgrade(UpgradeCancelMode::Rollback, |_| {});

    assert_eq!(result, UpgradeCancelResult::Success);
    assert_eq!(runtime.pending_timers(), 0);
    runtime.advance(Duration::from_secs(10));
    assert_eq!(machine.current_state(), Stage1);
    assert!(log.entered().is_empty());
}

#[test]
fn deferred_rollback_runs_callback_instead_of_next_state() {
    init_tracing();
    let runtime = ManualRuntime::new();
    let (machine, log) = machine(&runtime, awaiting(NonCancellableWithDeferredRollback));
    machine.start(None);

    let (calls, callback) = counter();
    let result = machine.try_cancel_upgrade(UpgradeCancelMode::Rollback, callback);
    assert_eq!(result, UpgradeCancelResult::Queued);
    assert_eq!(machine.life_cycle(), LifeCycleState::Cancelling);

    let again = machine.try_cancel_upgrade(UpgradeCancelMode::Rollback, |_| {});
    assert_eq!(again, UpgradeCancelResult::NotAllowed);

    log.take_operation().unwrap().complete(Ok(()));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(machine.is_closed());
    assert_eq!(machine.current_state(), Stage1);
    assert_eq!(log.entered(), vec![Stage1]);
    assert_eq!(machine.create_rollback_snapshot().state(), Stage1);
}

#[test]
fn deferred_rollback_in_normal_state_waits_for_its_continuation() {
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1)
        .parked(Stage1, NonCancellableWithDeferredRollback)
        .parked(Stage2, CancellableWithImmediateRollback);
    let (machine, log) = machine(&runtime, script);
    machine.start(None);

    let (calls, callback) = counter();
    assert_eq!(
        machine.try_cancel_upgrade(UpgradeCancelMode::Rollback, callback),
        UpgradeCancelResult::Queued
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    log.take_completion().unwrap().complete(Stage2);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(machine.is_closed());
    assert_eq!(log.entered(), vec![Stage1]);
}

#[test]
fn cancel_before_start_keeps_machine_unstarted() {
    let runtime = ManualRuntime::new();
    let (machine, log) = machine(&runtime, awaiting(CancellableWithImmediateRollback));

    assert_eq!(
        machine.try_cancel_upgrade(UpgradeCancelMode::Cancel, |_| {}),
        UpgradeCancelResult::Success
    );
    machine.start(None);

    assert_eq!(machine.current_state(), UpgradeStateName::None);
    assert!(log.entered().is_empty());
}

#[test]
fn cancel_after_completion_succeeds_without_effect() {
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1).step(Stage1, NonCancellableWithNoRollback, Completed);
    let (machine, log) = machine(&runtime, script);
    machine.start(None);
    assert!(machine.is_completed());

    assert_eq!(
        machine.try_cancel_upgrade(UpgradeCancelMode::Cancel, |_| {}),
        UpgradeCancelResult::Success
    );
    assert!(machine.is_completed());
    assert_eq!(log.replies(), 1);
}

#[test]
fn close_cancels_in_flight_operation_and_drops_deferred_callback() {
    let runtime = ManualRuntime::new();
    let (machine, log) = machine(&runtime, awaiting(NonCancellableWithDeferredRollback));
    machine.start(None);
    let operation = log.take_operation().unwrap();

    let (calls, callback) = counter();
    machine.try_cancel_upgrade(UpgradeCancelMode::Rollback, callback);
    machine.close();

    assert!(machine.is_closed());
    assert!(operation.is_cancel_requested());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(machine.async_operation().is_none());
}

#[test]
fn rollback_snapshot_reaches_the_successor_strategy() {
    let runtime = ManualRuntime::new();
    let (first, _) = machine(&runtime, awaiting(CancellableWithImmediateRollback));
    first.start(None);
    first.try_cancel_upgrade(UpgradeCancelMode::Rollback, |_| {});

    let (second, log) = machine(&runtime, awaiting(CancellableWithImmediateRollback));
    second.start(Some(first.create_rollback_snapshot()));

    assert_eq!(log.rollback().map(|s| s.state()), Some(Stage1));
    assert_eq!(second.current_state(), Stage1);
}

/// Stage1 finishes twice: through its continuation and by returning Stage2
#[derive(Clone)]
struct DoubleFinish {
    complete_inline: bool,
    entered: Arc<Mutex<Vec<UpgradeStateName>>>,
    parked: Arc<Mutex<Option<StateCompletion>>>,
}

impl DoubleFinish {
    fn new(complete_inline: bool) -> Self {
        Self {
            complete_inline,
            entered: Arc::default(),
            parked: Arc::default(),
        }
    }
}

impl Upgrade for DoubleFinish {
    fn activity_id(&self) -> &str {
        "double"
    }

    fn instance_id(&self) -> u64 {
        1
    }

    fn get_start_state(&self, _rollback: Option<&RollbackSnapshot>) -> UpgradeStateName {
        Stage1
    }

    fn state_description(&self, state: UpgradeStateName) -> UpgradeStateDescription {
        UpgradeStateDescription::normal(state, CancellableWithImmediateRollback)
    }

    fn enter_state(&self, state: UpgradeStateName, completion: StateCompletion) -> UpgradeStateName {
        self.entered.lock().push(state);
        match state {
            Stage1 if self.complete_inline => {
                completion.complete(Stage2);
                Stage2
            }
            Stage1 => {
                *self.parked.lock() = Some(completion);
                Stage2
            }
            _ => Completed,
        }
    }

    fn enter_async_operation_state(&self, _state: UpgradeStateName, _operation: AsyncOperation) {}

    fn exit_async_operation_state(
        &self,
        _state: UpgradeStateName,
        _operation: &AsyncOperation,
    ) -> UpgradeStateName {
        UpgradeStateName::Invalid
    }

    fn create_rollback_snapshot(&self, state: UpgradeStateName) -> RollbackSnapshot {
        RollbackSnapshot::new(state)
    }

    fn send_reply(&self) {}
}

#[test]
fn normal_state_finishing_twice_drives_once() {
    let runtime = ManualRuntime::new();
    let strategy = DoubleFinish::new(true);
    let machine = UpgradeStateMachine::create(Box::new(strategy.clone()), runtime.shared());

    machine.start(None);

    assert!(machine.is_completed());
    assert_eq!(*strategy.entered.lock(), vec![Stage1, Stage2]);
}

#[test]
fn late_continuation_after_returned_state_is_ignored() {
    let runtime = ManualRuntime::new();
    let strategy = DoubleFinish::new(false);
    let machine = UpgradeStateMachine::create(Box::new(strategy.clone()), runtime.shared());
    machine.start(None);
    assert!(machine.is_completed());

    let late = strategy.parked.lock().take().unwrap();
    late.complete(Stage2);

    assert_eq!(*strategy.entered.lock(), vec![Stage1, Stage2]);
    assert_eq!(machine.current_state(), Completed);
}

#[test]
fn async_state_without_a_next_state_stops_the_drive() {
    let runtime = ManualRuntime::new();
    let script = ScriptedUpgrade::new("act", 1).awaiting(
        Stage1,
        CancellableWithImmediateRollback,
        Stage2,
        UpgradeStateName::Invalid,
    );
    let (machine, log) = machine(&runtime, script);
    machine.start(None);

    log.take_operation()
        .unwrap()
        .complete(Err(StrataError::timeout("hosting")));

    assert_eq!(machine.current_state(), Stage1);
    assert!(machine.async_operation().is_none());
    assert!(!machine.is_closed());
    assert_eq!(log.entered(), vec![Stage1]);
}
