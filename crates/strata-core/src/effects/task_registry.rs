//! Tokio-backed runtime and background task tracking
//!
//! Every task the failover manager or reconfiguration agent starts is tracked
//! here so shutdown aborts timers, posted callbacks and periodic scans together.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::runtime::{RuntimeEffects, Task, TimerHandle};
use crate::errors::{Result, StrataError};

/// Shared task registry for background work
#[derive(Debug)]
pub struct TaskRegistry {
    handle: Handle,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Registry spawning onto `handle`
    pub fn new(handle: Handle) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            handle,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Registry spawning onto the runtime the caller is running in
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| StrataError::not_ready(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(handle))
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Spawn a future that stops at shutdown
    pub fn spawn_cancellable<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = self.handle.spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = fut => {}
            }
        });
        self.track(handle);
    }

    /// Call `f` every `interval` until it returns false or shutdown
    pub fn spawn_interval_until<F, Fut>(&self, interval: Duration, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = self.handle.spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if !f().await {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        self.track(handle);
    }

    /// Whether [`TaskRegistry::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Abort everything still running
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock();
        tracing::debug!(tasks = handles.len(), "Task registry shutting down");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

impl RuntimeEffects for TaskRegistry {
    fn post(&self, task: Task) {
        self.spawn_cancellable(async move { task() });
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let timer = TimerHandle::new();
        let armed = timer.clone();
        self.spawn_cancellable(async move {
            tokio::time::sleep(delay).await;
            if !armed.is_cancelled() {
                task();
            }
        });
        timer
    }

    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        self.spawn_cancellable(fut);
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let registry = TaskRegistry::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let kept = registry.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&fired);
        let dropped = registry.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            }),
        );
        dropped.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!kept.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_stops_when_callback_declines() {
        let registry = TaskRegistry::current().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        registry.spawn_interval_until(Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move { counter.fetch_add(1, Ordering::SeqCst) < 2 }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_posts() {
        let registry = TaskRegistry::current().unwrap();
        registry.shutdown();
        assert!(registry.is_shut_down());
    }
}
