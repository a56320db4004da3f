//! Operation mutex
//!
//! The link tracks only one outstanding ATT request, so every correlated
//! request holds this lock from submission until its completion event (or
//! failure). Waiters are served in FIFO order; the lock is not re-entrant.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};

pub struct OperationLock {
    inner: Mutex<()>,
    waiting: AtomicUsize,
}

/// Held for the duration of one request. Dropping it releases the lock,
/// which also covers cancellation of the owning future.
pub struct OperationGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    op: &'static str,
}

impl OperationLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
            waiting: AtomicUsize::new(0),
        }
    }

    pub async fn acquire(&self, op: &'static str) -> OperationGuard<'_> {
        let waiting = Waiting::enter(&self.waiting);
        if waiting.ahead > 0 {
            log::trace!("{} queued behind {} pending operation(s)", op, waiting.ahead);
        }
        let guard = self.inner.lock().await;
        drop(waiting);
        log::trace!("{} acquired operation lock", op);
        OperationGuard { _guard: guard, op }
    }

    /// Number of callers currently waiting for the lock.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a caller as waiting until it gets the lock or gives up.
struct Waiting<'a> {
    counter: &'a AtomicUsize,
    ahead: usize,
}

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let ahead = counter.fetch_add(1, Ordering::SeqCst);
        Self { counter, ahead }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        log::trace!("{} released operation lock", self.op);
    }
}
