//! Per-key routing of upgrade and cancel messages

use std::cell::Cell;
use std::sync::Arc;

use strata_reconfig::{
    CancelBehaviorType, UpgradeCancelResult, UpgradeMessageProcessor, UpgradeStateMachine,
    UpgradeStateName,
};
use strata_testkit::{ManualRuntime, ScriptLog, ScriptedUpgrade};

use CancelBehaviorType::*;
use UpgradeStateName::{Completed, Stage1};

const KEY: &str = "fabric";

struct Harness {
    runtime: Arc<ManualRuntime>,
    processor: Arc<UpgradeMessageProcessor>,
}

impl Harness {
    fn new() -> Self {
        Self {
            runtime: ManualRuntime::new(),
            processor: UpgradeMessageProcessor::new(),
        }
    }

    fn machine(&self, instance: u64, behavior: CancelBehaviorType) -> (Arc<UpgradeStateMachine>, Arc<ScriptLog>) {
        let script = ScriptedUpgrade::new(format!("act-{instance}"), instance)
            .awaiting(Stage1, behavior, Completed, Stage1);
        let log = script.log();
        (UpgradeStateMachine::create(Box::new(script), self.runtime.shared()), log)
    }

    fn offer(&self, machine: &Arc<UpgradeStateMachine>) -> bool {
        self.processor.process_upgrade_message(KEY, Arc::clone(machine))
    }

    fn current_instance(&self) -> Option<u64> {
        self.processor.current(KEY).map(|m| m.upgrade().instance_id())
    }
}

#[test]
fn first_upgrade_starts_immediately() {
    let h = Harness::new();
    let (machine, log) = h.machine(1, CancellableWithImmediateRollback);

    assert!(h.offer(&machine));

    assert_eq!(log.entered(), vec![Stage1]);
    assert!(h.processor.is_upgrading(KEY));
    assert_eq!(h.current_instance(), Some(1));
}

#[test]
fn newer_upgrade_rolls_back_the_running_one() {
    let h = Harness::new();
    let (first, _) = h.machine(1, CancellableWithImmediateRollback);
    let (second, log) = h.machine(2, CancellableWithImmediateRollback);
    h.offer(&first);

    assert!(h.offer(&second));

    assert!(first.is_closed());
    assert_eq!(h.current_instance(), Some(2));
    assert_eq!(log.rollback().map(|s| s.state()), Some(Stage1));
    assert_eq!(log.entered(), vec![Stage1]);
}

#[test]
fn newer_upgrade_waits_for_deferred_rollback() {
    let h = Harness::new();
    let (first, first_log) = h.machine(1, NonCancellableWithDeferredRollback);
    let (second, second_log) = h.machine(2, CancellableWithImmediateRollback);
    h.offer(&first);

    assert!(h.offer(&second));
    assert!(second_log.entered().is_empty());
    assert_eq!(h.current_instance(), Some(1));

    first_log.take_operation().unwrap().complete(Ok(()));

    assert!(first.is_closed());
    assert_eq!(h.current_instance(), Some(2));
    assert_eq!(second_log.entered(), vec![Stage1]);
    assert_eq!(second_log.rollback().map(|s| s.state()), Some(Stage1));
}

#[test]
fn newest_upgrade_replaces_one_queued_behind_rollback() {
    let h = Harness::new();
    let (first, first_log) = h.machine(1, NonCancellableWithDeferredRollback);
    let (second, second_log) = h.machine(2, CancellableWithImmediateRollback);
    let (third, third_log) = h.machine(3, CancellableWithImmediateRollback);
    h.offer(&first);
    h.offer(&second);

    assert!(h.offer(&third));
    assert!(!h.offer(&second));

    first_log.take_operation().unwrap().complete(Ok(()));

    assert_eq!(h.current_instance(), Some(3));
    assert!(second_log.entered().is_empty());
    assert_eq!(third_log.entered(), vec![Stage1]);
    assert!(!third.is_closed());
}

#[test]
fn upgrade_that_cannot_roll_back_keeps_running() {
    let h = Harness::new();
    let (first, first_log) = h.machine(1, NonCancellableWithNoRollback);
    let (second, second_log) = h.machine(2, CancellableWithImmediateRollback);
    h.offer(&first);

    assert!(!h.offer(&second));
    assert_eq!(h.current_instance(), Some(1));
    assert!(second_log.entered().is_empty());

    first_log.take_operation().unwrap().complete(Ok(()));
    assert!(first.is_completed());

    let (third, third_log) = h.machine(3, CancellableWithImmediateRollback);
    assert!(h.offer(&third));
    assert!(first.is_closed());
    assert_eq!(third_log.rollback(), None);
    assert_eq!(h.current_instance(), Some(3));
}

#[test]
fn stale_upgrade_is_ignored() {
    let h = Harness::new();
    let (running, _) = h.machine(5, CancellableWithImmediateRollback);
    let (stale, stale_log) = h.machine(3, CancellableWithImmediateRollback);
    h.offer(&running);

    assert!(!h.offer(&stale));

    assert!(stale_log.entered().is_empty());
    assert_eq!(h.current_instance(), Some(5));
}

#[test]
fn duplicate_of_finished_upgrade_resends_reply() {
    let h = Harness::new();
    let (first, log) = h.machine(1, CancellableWithImmediateRollback);
    h.offer(&first);
    log.take_operation().unwrap().complete(Ok(()));
    assert_eq!(log.replies(), 1);

    let (duplicate, duplicate_log) = h.machine(1, CancellableWithImmediateRollback);
    assert!(!h.offer(&duplicate));

    assert_eq!(log.replies(), 2);
    assert!(duplicate_log.entered().is_empty());
    assert!(!h.processor.is_upgrading(KEY));
}

#[test]
fn cancel_stops_the_running_upgrade_and_replies() {
    let h = Harness::new();
    let (machine, _) = h.machine(4, CancellableWithImmediateRollback);
    h.offer(&machine);
    let replied = Cell::new(false);

    let result = h.processor.process_cancel_upgrade_message(KEY, 4, || replied.set(true));

    assert_eq!(result, UpgradeCancelResult::Success);
    assert!(replied.get());
    assert!(machine.is_closed());
    assert!(h.processor.current(KEY).is_none());
}

#[test]
fn cancel_for_older_attempt_is_refused() {
    let h = Harness::new();
    let (machine, _) = h.machine(4, CancellableWithImmediateRollback);
    h.offer(&machine);
    let replied = Cell::new(false);

    let result = h.processor.process_cancel_upgrade_message(KEY, 3, || replied.set(true));

    assert_eq!(result, UpgradeCancelResult::NotAllowed);
    assert!(!replied.get());
    assert!(!machine.is_closed());
}

#[test]
fn cancel_refused_by_state_keeps_upgrade() {
    let h = Harness::new();
    let (machine, _) = h.machine(4, NonCancellableWithDeferredRollback);
    h.offer(&machine);
    let replied = Cell::new(false);

    let result = h.processor.process_cancel_upgrade_message(KEY, 4, || replied.set(true));

    assert_eq!(result, UpgradeCancelResult::NotAllowed);
    assert!(!replied.get());
    assert!(h.processor.is_upgrading(KEY));
}

#[test]
fn cancel_without_upgrade_replies_at_once() {
    let h = Harness::new();
    let replied = Cell::new(false);

    let result = h.processor.process_cancel_upgrade_message(KEY, 1, || replied.set(true));

    assert_eq!(result, UpgradeCancelResult::Success);
    assert!(replied.get());
}

#[test]
fn closed_processor_refuses_new_upgrades() {
    let h = Harness::new();
    let (running, _) = h.machine(1, NonCancellableWithNoRollback);
    h.offer(&running);

    h.processor.close();
    let (late, late_log) = h.machine(2, CancellableWithImmediateRollback);

    assert!(running.is_closed());
    assert!(!h.offer(&late));
    assert!(late.is_closed());
    assert!(late_log.entered().is_empty());
}
