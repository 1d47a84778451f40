//! One-shot handle for the asynchronous work behind an async API state
//!
//! The handle resolves exactly once. Natural completion and cancellation race
//! through the same slot: whichever writes first decides the outcome, later
//! writes are ignored. The handle also records whether it resolved before the
//! state machine finished starting it, in which case the machine continues on
//! the starting thread and the completion callback is never invoked.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::{Result, StrataError};

type CompletionCallback = Box<dyn FnOnce(&AsyncOperation) + Send>;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Started,
}

struct OperationState {
    phase: Phase,
    outcome: Option<Result<()>>,
    completed_synchronously: bool,
    callback: Option<CompletionCallback>,
}

struct Inner {
    id: u64,
    cancel_requested: AtomicBool,
    state: Mutex<OperationState>,
}

/// Shared handle to one asynchronous operation
#[derive(Clone)]
pub struct AsyncOperation {
    inner: Arc<Inner>,
}

impl AsyncOperation {
    pub(crate) fn new(callback: CompletionCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
                cancel_requested: AtomicBool::new(false),
                state: Mutex::new(OperationState {
                    phase: Phase::Starting,
                    outcome: None,
                    completed_synchronously: false,
                    callback: Some(callback),
                }),
            }),
        }
    }

    /// Process-unique id used in traces
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Resolve the operation; returns false if it had already resolved
    pub fn complete(&self, result: Result<()>) -> bool {
        let callback = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(result);
            match state.phase {
                Phase::Started => state.callback.take(),
                Phase::Starting => None,
            }
        };
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    /// Ask the operation to stop; resolves it as cancelled if still pending
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        self.complete(Err(StrataError::canceled(format!(
            "async operation {}",
            self.inner.id
        ))));
    }

    /// Whether [`AsyncOperation::cancel`] was called
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    /// Whether the operation resolved
    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Whether the operation resolved before its starter returned
    pub fn completed_synchronously(&self) -> bool {
        self.inner.state.lock().completed_synchronously
    }

    /// Outcome once resolved
    pub fn outcome(&self) -> Option<Result<()>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Whether both handles refer to the same operation
    pub fn ptr_eq(&self, other: &AsyncOperation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Mark the start as finished; true when the operation already resolved
    pub(crate) fn finish_start(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.outcome.is_some() {
            state.completed_synchronously = true;
            state.callback = None;
            return true;
        }
        state.phase = Phase::Started;
        false
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AsyncOperation")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("outcome", &state.outcome)
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (AsyncOperation, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let op = AsyncOperation::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (op, calls)
    }

    #[test]
    fn synchronous_completion_skips_callback() {
        let (op, calls) = counting();
        assert!(op.complete(Ok(())));
        assert!(op.finish_start());
        assert!(op.completed_synchronously());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn asynchronous_completion_invokes_callback_once() {
        let (op, calls) = counting();
        assert!(!op.finish_start());
        assert!(op.complete(Ok(())));
        assert!(!op.complete(Err(StrataError::timeout("late"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(op.outcome(), Some(Ok(())));
    }

    #[test]
    fn cancel_wins_when_first() {
        let (op, calls) = counting();
        op.finish_start();
        op.cancel();
        assert!(!op.complete(Ok(())));
        assert!(op.is_cancel_requested());
        assert!(matches!(
            op.outcome(),
            Some(Err(StrataError::OperationCanceled { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_wins_over_late_cancel() {
        let (op, _) = counting();
        op.finish_start();
        op.complete(Ok(()));
        op.cancel();
        assert!(op.is_cancel_requested());
        assert_eq!(op.outcome(), Some(Ok(())));
    }
}
