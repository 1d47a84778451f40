//! Deterministic runtime with a virtual clock
//!
//! Posted tasks and spawned futures run only when a test calls
//! [`ManualRuntime::run_until_idle`] or [`ManualRuntime::advance`]; timers
//! fire only when virtual time passes their deadline.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use parking_lot::Mutex;
use strata_core::{RuntimeEffects, SharedRuntime, Task, TimerHandle};

struct ScheduledTimer {
    deadline: Instant,
    sequence: u64,
    handle: TimerHandle,
    task: Task,
}

struct RuntimeState {
    now: Instant,
    posted: VecDeque<Task>,
    timers: Vec<ScheduledTimer>,
    futures: Vec<BoxFuture<'static, ()>>,
    next_sequence: u64,
}

/// Single-threaded runtime driven by the test
pub struct ManualRuntime {
    state: Mutex<RuntimeState>,
}

impl ManualRuntime {
    /// Runtime whose clock starts at the real now
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState {
                now: Instant::now(),
                posted: VecDeque::new(),
                timers: Vec::new(),
                futures: Vec::new(),
                next_sequence: 0,
            }),
        })
    }

    /// Same runtime as a trait object
    pub fn shared(self: &Arc<Self>) -> SharedRuntime {
        Arc::clone(self) as SharedRuntime
    }

    /// Timers armed and not cancelled
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }

    /// Spawned futures not yet finished
    pub fn pending_futures(&self) -> usize {
        self.state.lock().futures.len()
    }

    /// Run posted tasks and poll futures until nothing makes progress
    pub fn run_until_idle(&self) {
        self.drain();
    }

    fn drain(&self) -> bool {
        let mut progressed = false;
        loop {
            let posted = self.state.lock().posted.pop_front();
            if let Some(task) = posted {
                task();
                progressed = true;
                continue;
            }
            if !self.poll_futures() {
                return progressed;
            }
            progressed = true;
        }
    }

    fn poll_futures(&self) -> bool {
        let futures = std::mem::take(&mut self.state.lock().futures);
        if futures.is_empty() {
            return false;
        }
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut progressed = false;
        let mut still_pending = Vec::new();
        for mut fut in futures {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => progressed = true,
                Poll::Pending => still_pending.push(fut),
            }
        }
        let mut state = self.state.lock();
        let spawned_meanwhile = std::mem::take(&mut state.futures);
        progressed |= !spawned_meanwhile.is_empty();
        state.futures = still_pending;
        state.futures.extend(spawned_meanwhile);
        progressed
    }

    /// Move the clock forward, firing due timers in deadline order
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;
        loop {
            self.run_until_idle();
            let due = {
                let mut state = self.state.lock();
                state.timers.retain(|t| !t.handle.is_cancelled());
                let next = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.sequence))
                    .map(|(index, _)| index);
                next.map(|index| {
                    let timer = state.timers.swap_remove(index);
                    state.now = state.now.max(timer.deadline);
                    timer
                })
            };
            match due {
                Some(timer) if !timer.handle.is_cancelled() => (timer.task)(),
                Some(_) => {}
                None => break,
            }
        }
        self.state.lock().now = target;
        self.run_until_idle();
    }

    /// Drive `fut` to completion on this runtime and return its output
    pub fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        let mut fut = Box::pin(fut);
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
                return output;
            }
            assert!(self.drain(), "future stalled with nothing left to run");
        }
    }
}

impl RuntimeEffects for ManualRuntime {
    fn post(&self, task: Task) {
        self.state.lock().posted.push_back(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let deadline = state.now + delay;
        state.timers.push(ScheduledTimer {
            deadline,
            sequence,
            handle: handle.clone(),
            task,
        });
        handle
    }

    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        self.state.lock().futures.push(fut);
    }

    fn now(&self) -> Instant {
        self.state.lock().now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn timers_fire_in_deadline_order() {
        let runtime = ManualRuntime::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(3, 'c'), (1, 'a'), (2, 'b')] {
            let order = Arc::clone(&order);
            runtime.schedule(
                Duration::from_secs(delay),
                Box::new(move || order.lock().push(tag)),
            );
        }
        runtime.advance(Duration::from_secs(2));
        assert_eq!(*order.lock(), vec!['a', 'b']);
        runtime.advance(Duration::from_secs(1));
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn cancelled_timer_never_runs() {
        let runtime = ManualRuntime::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = runtime.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        runtime.advance(Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.pending_timers(), 0);
    }

    #[test]
    fn posts_run_only_when_driven() {
        let runtime = ManualRuntime::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        runtime.post(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        runtime.run_until_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
