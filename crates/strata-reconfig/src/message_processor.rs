//! Routes upgrade and cancel messages to state machines
//!
//! One machine runs per key. A newer upgrade for a busy key rolls the running
//! machine back first; the newcomer starts from the rollback snapshot once the
//! old machine has closed. Machine methods are never called with the
//! processor's lock held, since a machine may call back into the processor
//! from a cancel callback.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::state::{LifeCycleState, UpgradeCancelMode, UpgradeCancelResult};
use crate::state_machine::UpgradeStateMachine;

struct Entry {
    current: Arc<UpgradeStateMachine>,
    pending: Option<Arc<UpgradeStateMachine>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    closed: bool,
}

enum Plan {
    Closed,
    Start,
    Stale,
    Duplicate(Arc<UpgradeStateMachine>),
    QueuedBehindRollback,
    Rollback(Arc<UpgradeStateMachine>),
}

/// Per-key owner of upgrade state machines
#[derive(Default)]
pub struct UpgradeMessageProcessor {
    inner: Mutex<Inner>,
}

impl UpgradeMessageProcessor {
    /// Empty processor
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand `incoming` the upgrade for `key`
    ///
    /// Returns true when `incoming` started or will start once its
    /// predecessor has rolled back. A duplicate of a finished upgrade re-sends
    /// the reply.
    pub fn process_upgrade_message(
        self: &Arc<Self>,
        key: &str,
        incoming: Arc<UpgradeStateMachine>,
    ) -> bool {
        let incoming_instance = incoming.upgrade().instance_id();
        let plan = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Plan::Closed
            } else {
                match inner.entries.get_mut(key) {
                    None => {
                        inner.entries.insert(
                            key.to_string(),
                            Entry {
                                current: Arc::clone(&incoming),
                                pending: None,
                            },
                        );
                        Plan::Start
                    }
                    Some(entry) => {
                        let current_instance = entry.current.upgrade().instance_id();
                        let pending_instance =
                            entry.pending.as_ref().map(|p| p.upgrade().instance_id());
                        if incoming_instance < current_instance
                            || pending_instance.is_some_and(|p| p >= incoming_instance)
                        {
                            Plan::Stale
                        } else if incoming_instance == current_instance {
                            Plan::Duplicate(Arc::clone(&entry.current))
                        } else {
                            entry.pending = Some(Arc::clone(&incoming));
                            if entry.current.life_cycle() == LifeCycleState::Cancelling {
                                Plan::QueuedBehindRollback
                            } else {
                                Plan::Rollback(Arc::clone(&entry.current))
                            }
                        }
                    }
                }
            }
        };

        match plan {
            Plan::Closed => {
                incoming.close();
                false
            }
            Plan::Start => {
                incoming.start(None);
                true
            }
            Plan::Stale => {
                tracing::debug!(
                    key,
                    instance_id = incoming_instance,
                    "Stale upgrade message ignored"
                );
                false
            }
            Plan::Duplicate(current) => {
                if current.is_completed() {
                    current.send_reply();
                }
                false
            }
            Plan::QueuedBehindRollback => true,
            Plan::Rollback(current) => self.roll_back(key, current, incoming),
        }
    }

    fn roll_back(
        self: &Arc<Self>,
        key: &str,
        current: Arc<UpgradeStateMachine>,
        incoming: Arc<UpgradeStateMachine>,
    ) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        let callback_key = key.to_string();
        let result = current.try_cancel_upgrade(UpgradeCancelMode::Rollback, move |closed| {
            if let Some(processor) = weak.upgrade() {
                processor.on_rolled_back(&callback_key, &closed);
            }
        });
        tracing::info!(
            key,
            from = current.upgrade().instance_id(),
            to = incoming.upgrade().instance_id(),
            ?result,
            "Rolling back running upgrade"
        );

        match result {
            UpgradeCancelResult::Success => {
                self.on_rolled_back(key, &current);
                true
            }
            UpgradeCancelResult::Queued => true,
            UpgradeCancelResult::NotAllowed => {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.entries.get_mut(key) {
                    if entry
                        .pending
                        .as_ref()
                        .is_some_and(|pending| Arc::ptr_eq(pending, &incoming))
                    {
                        entry.pending = None;
                    }
                }
                false
            }
        }
    }

    fn on_rolled_back(&self, key: &str, previous: &Arc<UpgradeStateMachine>) {
        let next = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(key) else {
                return;
            };
            if !Arc::ptr_eq(&entry.current, previous) {
                return;
            }
            match entry.pending.take() {
                Some(next) => {
                    entry.current = Arc::clone(&next);
                    next
                }
                None => {
                    inner.entries.remove(key);
                    return;
                }
            }
        };

        let snapshot = if previous.is_closed() {
            Some(previous.create_rollback_snapshot())
        } else {
            previous.close();
            None
        };
        next.start(snapshot);
    }

    /// Cancel the upgrade for `key` up to `instance_id`
    ///
    /// `reply` runs when the key ends up with no running upgrade.
    pub fn process_cancel_upgrade_message<F>(
        &self,
        key: &str,
        instance_id: u64,
        reply: F,
    ) -> UpgradeCancelResult
    where
        F: FnOnce(),
    {
        let current = self
            .inner
            .lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.current));
        let Some(current) = current else {
            reply();
            return UpgradeCancelResult::Success;
        };
        if current.upgrade().instance_id() > instance_id {
            tracing::debug!(
                key,
                instance_id,
                running = current.upgrade().instance_id(),
                "Cancel for an older upgrade ignored"
            );
            return UpgradeCancelResult::NotAllowed;
        }

        let result = current.try_cancel_upgrade(UpgradeCancelMode::Cancel, |_| {});
        if result == UpgradeCancelResult::Success {
            let pending = {
                let mut inner = self.inner.lock();
                let owned = inner
                    .entries
                    .get(key)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.current, &current));
                if owned {
                    inner.entries.remove(key).and_then(|entry| entry.pending)
                } else {
                    None
                }
            };
            if let Some(pending) = pending {
                pending.close();
            }
            reply();
        }
        result
    }

    /// Whether `key` has an unfinished upgrade
    pub fn is_upgrading(&self, key: &str) -> bool {
        let current = self
            .inner
            .lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.current));
        current.is_some_and(|machine| !machine.is_completed() && !machine.is_closed())
    }

    /// Machine currently owning `key`
    pub fn current(&self, key: &str) -> Option<Arc<UpgradeStateMachine>> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.current))
    }

    /// Close every machine and refuse further messages
    pub fn close(&self) {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.current.close();
            if let Some(pending) = entry.pending {
                pending.close();
            }
        }
    }
}
