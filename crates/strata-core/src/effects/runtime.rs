//! Runtime effects: thread-pool posts, one-shot timers, spawned futures, clock
//!
//! State machines in this workspace never block. They post short callbacks,
//! arm timers that call back later, and spawn futures for collaborator calls
//! that suspend. Going through [`RuntimeEffects`] lets production use tokio
//! while tests advance a virtual clock deterministically.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

/// A unit of work run on the pool
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle for a scheduled task
///
/// Cancelling is idempotent. A task whose handle was cancelled before the
/// deadline never runs.
#[derive(Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Create an armed handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`TimerHandle::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduling surface used by every state machine
///
/// Implementations must never run a task inline from `post` or `schedule`;
/// callers invoke these while holding their own locks.
pub trait RuntimeEffects: Send + Sync {
    /// Run `task` on the pool as soon as possible
    fn post(&self, task: Task);

    /// Run `task` once after `delay` unless the returned handle is cancelled
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Drive `fut` to completion in the background
    fn spawn(&self, fut: BoxFuture<'static, ()>);

    /// Monotonic now
    fn now(&self) -> Instant;
}

/// Shared handle to the runtime
pub type SharedRuntime = Arc<dyn RuntimeEffects>;
