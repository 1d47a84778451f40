//! Resident failover units with per-unit task dispatch
//!
//! Tasks for one failover unit run one at a time, in submission order, on the
//! runtime pool. A task works on a copy of the unit; the copy replaces the
//! resident unit only after the store accepted it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::{FailoverUnitId, NodeInstance, Result, SharedRuntime, StrataError};

use crate::failover_unit::FailoverUnit;
use crate::store::FailoverStore;

/// Work applied to one failover unit
pub trait FailoverUnitTask: Send + 'static {
    /// Inspect or change `unit`; true when the change must be persisted
    fn check_failover_unit(&mut self, unit: &mut FailoverUnit) -> bool;

    /// Outcome of the write, or `Ok` when nothing needed writing
    fn on_committed(self: Box<Self>, result: Result<()>);
}

struct QueuedTask {
    task: Box<dyn FailoverUnitTask>,
    from: NodeInstance,
}

struct Slot {
    unit: FailoverUnit,
    queue: VecDeque<QueuedTask>,
    draining: bool,
}

/// Failover units owned by this failover manager
pub struct FailoverUnitCache {
    units: Mutex<HashMap<FailoverUnitId, Slot>>,
    runtime: SharedRuntime,
    store: Arc<dyn FailoverStore>,
}

impl FailoverUnitCache {
    /// Empty cache
    pub fn new(runtime: SharedRuntime, store: Arc<dyn FailoverStore>) -> Arc<Self> {
        Arc::new(Self {
            units: Mutex::new(HashMap::new()),
            runtime,
            store,
        })
    }

    /// Make `unit` resident
    pub fn insert(&self, unit: FailoverUnit) -> Result<()> {
        let mut units = self.units.lock();
        if units.contains_key(&unit.id) {
            return Err(StrataError::failover_unit_already_exists(unit.id.to_string()));
        }
        units.insert(
            unit.id,
            Slot {
                unit,
                queue: VecDeque::new(),
                draining: false,
            },
        );
        Ok(())
    }

    /// Copy of a resident unit
    pub fn get(&self, id: FailoverUnitId) -> Option<FailoverUnit> {
        self.units.lock().get(&id).map(|slot| slot.unit.clone())
    }

    /// Copies of every resident unit
    pub fn snapshot(&self) -> Vec<FailoverUnit> {
        self.units.lock().values().map(|slot| slot.unit.clone()).collect()
    }

    /// Number of resident units
    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    /// Whether no unit is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `task` for the unit `id`
    ///
    /// Hands the task back when the unit is not resident; the caller decides
    /// whether to retry or give up.
    pub fn try_process_task_async(
        self: &Arc<Self>,
        id: FailoverUnitId,
        task: Box<dyn FailoverUnitTask>,
        from: NodeInstance,
        is_high_priority: bool,
    ) -> std::result::Result<(), Box<dyn FailoverUnitTask>> {
        let start_drain = {
            let mut units = self.units.lock();
            let Some(slot) = units.get_mut(&id) else {
                return Err(task);
            };
            let queued = QueuedTask { task, from };
            if is_high_priority {
                slot.queue.push_front(queued);
            } else {
                slot.queue.push_back(queued);
            }
            !std::mem::replace(&mut slot.draining, true)
        };

        if start_drain {
            let cache = Arc::clone(self);
            self.runtime.post(Box::new(move || cache.drain(id)));
        }
        Ok(())
    }

    fn drain(&self, id: FailoverUnitId) {
        loop {
            let (queued, mut unit) = {
                let mut units = self.units.lock();
                let Some(slot) = units.get_mut(&id) else {
                    return;
                };
                match slot.queue.pop_front() {
                    Some(queued) => (queued, slot.unit.clone()),
                    None => {
                        slot.draining = false;
                        return;
                    }
                }
            };

            let QueuedTask { mut task, from } = queued;
            let result = if task.check_failover_unit(&mut unit) {
                self.commit(unit)
            } else {
                Ok(())
            };
            if let Err(error) = &result {
                tracing::info!(
                    failover_unit = %id,
                    from = %from,
                    error = %error,
                    "Failover unit update failed"
                );
            }
            task.on_committed(result);
        }
    }

    fn commit(&self, unit: FailoverUnit) -> Result<()> {
        self.store.update_failover_unit(&unit)?;
        if let Some(slot) = self.units.lock().get_mut(&unit.id) {
            slot.unit = unit;
        }
        Ok(())
    }
}
