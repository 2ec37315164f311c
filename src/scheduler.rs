//! A small `Scheduler` capability wrapping Tokio tasks for the background
//! timers the system needs: retention sweeps, the reconciliation loop, and
//! deferred webhook re-enqueue. Centralizing them here means shutdown can
//! cancel every outstanding timer through one `Vec` of abort handles instead
//! of each subsystem inventing its own bookkeeping.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;

/// Owns every timer handle spawned through [`Scheduler::every`] or
/// [`Scheduler::after`] so shutdown can cancel them all at once.
#[derive(Default)]
pub struct Scheduler {
    handles: Mutex<Vec<AbortHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` once per `period`, starting after the first tick (i.e. not
    /// immediately on registration).
    pub fn every<F, Fut>(&self, period: Duration, mut f: F) -> AbortHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                f().await;
            }
        });
        let handle = join.abort_handle();
        self.track(handle.clone());
        handle
    }

    /// Runs `f` once, after `delay`. The spawned task is tagged for the
    /// process lifetime (tracked in `handles`) so shutdown can cancel it
    /// rather than let it keep the runtime alive.
    pub fn after<F, Fut>(&self, delay: Duration, f: F) -> AbortHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        });
        let handle = join.abort_handle();
        self.track(handle.clone());
        handle
    }

    /// Records `handle`, first dropping any already-finished entries so a
    /// long-lived process doesn't accumulate one dead handle per `after`
    /// timer that has already fired.
    fn track(&self, handle: AbortHandle) {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Cancels every timer registered so far. Called once, from shutdown.
    pub fn cancel_all(&self) {
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}
