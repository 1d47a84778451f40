//! Per-unit task dispatch on the failover unit cache

use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::{FailoverUnitId, Result};
use strata_failover::{FailoverStore, FailoverUnit, FailoverUnitCache, FailoverUnitTask};
use strata_testkit::{node_instance, ManualRuntime, MemoryStore, StoreOperation};

type Log = Arc<Mutex<Vec<(u64, bool)>>>;

/// Sets the target size and records how the write went
struct Resize {
    size: usize,
    tag: u64,
    log: Log,
}

impl FailoverUnitTask for Resize {
    fn check_failover_unit(&mut self, unit: &mut FailoverUnit) -> bool {
        if unit.target_replica_set_size == self.size {
            return false;
        }
        unit.target_replica_set_size = self.size;
        true
    }

    fn on_committed(self: Box<Self>, result: Result<()>) {
        self.log.lock().push((self.tag, result.is_ok()));
    }
}

struct Fixture {
    runtime: Arc<ManualRuntime>,
    store: Arc<MemoryStore>,
    cache: Arc<FailoverUnitCache>,
    log: Log,
    id: FailoverUnitId,
}

impl Fixture {
    fn new() -> Self {
        let runtime = ManualRuntime::new();
        let store = Arc::new(MemoryStore::new());
        let cache = FailoverUnitCache::new(runtime.shared(), store.clone() as Arc<dyn FailoverStore>);
        let id = FailoverUnitId::from_name("p1");
        cache
            .insert(FailoverUnit::stateful(id, "fabric:/svc", 1, 3, 2))
            .unwrap();
        Self {
            runtime,
            store,
            cache,
            log: Log::default(),
            id,
        }
    }

    fn submit(&self, size: usize, tag: u64, high_priority: bool) -> bool {
        let task = Box::new(Resize {
            size,
            tag,
            log: Arc::clone(&self.log),
        });
        self.cache
            .try_process_task_async(self.id, task, node_instance(1, 1), high_priority)
            .is_ok()
    }
}

#[test]
fn tasks_run_in_submission_order_on_the_pool() {
    let f = Fixture::new();

    assert!(f.submit(5, 1, false));
    assert!(f.submit(7, 2, false));
    assert!(f.log.lock().is_empty());

    f.runtime.run_until_idle();

    assert_eq!(*f.log.lock(), vec![(1, true), (2, true)]);
    assert_eq!(f.cache.get(f.id).unwrap().target_replica_set_size, 7);
    assert_eq!(f.store.write_count(), 2);
}

#[test]
fn high_priority_task_jumps_the_queue() {
    let f = Fixture::new();

    f.submit(5, 1, false);
    f.submit(7, 2, true);
    f.runtime.run_until_idle();

    assert_eq!(*f.log.lock(), vec![(2, true), (1, true)]);
    assert_eq!(f.cache.get(f.id).unwrap().target_replica_set_size, 5);
}

#[test]
fn unchanged_unit_is_not_written() {
    let f = Fixture::new();

    f.submit(3, 1, false);
    f.runtime.run_until_idle();

    assert_eq!(*f.log.lock(), vec![(1, true)]);
    assert_eq!(f.store.write_count(), 0);
}

#[test]
fn missing_unit_hands_the_task_back() {
    let f = Fixture::new();
    let task = Box::new(Resize {
        size: 5,
        tag: 1,
        log: Arc::clone(&f.log),
    });

    let returned = f
        .cache
        .try_process_task_async(FailoverUnitId::from_name("p9"), task, node_instance(1, 1), false);

    assert!(returned.is_err());
    f.runtime.run_until_idle();
    assert!(f.log.lock().is_empty());
}

#[test]
fn failed_write_keeps_the_resident_unit() {
    let f = Fixture::new();
    f.store.fail_next(StoreOperation::FailoverUnit, 1);

    f.submit(5, 1, false);
    f.runtime.run_until_idle();

    assert_eq!(*f.log.lock(), vec![(1, false)]);
    assert_eq!(f.cache.get(f.id).unwrap().target_replica_set_size, 3);
    assert!(f.store.failover_unit(f.id).is_none());
}

#[test]
fn duplicate_insert_is_refused() {
    let f = Fixture::new();

    let again = f.cache.insert(FailoverUnit::stateful(f.id, "fabric:/svc", 1, 3, 2));

    assert!(again.is_err());
    assert_eq!(f.cache.len(), 1);
}
