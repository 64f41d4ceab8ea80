//! Cooperative cancellation shared by every loop level of a run.
//!
//! A single flag is polled at global pass boundaries, local pass boundaries, every
//! [`CANCEL_CHECK_INTERVAL`](crate::convergence::CANCEL_CHECK_INTERVAL) scanned instructions, and
//! by threads blocked in the scheduler. Blocked threads are woken by whoever raises the flag; no
//! thread is ever interrupted.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};

/// A callback run once when a token is cancelled.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Identifies a waker registered with [`CancellationToken::on_cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakerId(u64);

struct Inner {
    cancelled: AtomicBool,
    /// Wakers registered by blocking waiters (schedulers), notified once on cancellation.
    wakers: Mutex<Vec<(WakerId, Waker)>>,
    next_waker: AtomicU64,
    /// Used by [`CancellationToken::sleep`].
    lock: Mutex<()>,
    condvar: Condvar,
}

/// A cloneable handle to one shared cancellation flag.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                wakers: Mutex::new(vec![]),
                next_waker: AtomicU64::new(0),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation and wake every registered waiter. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let wakers = match self.inner.wakers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (_, wake) in wakers {
            wake();
        }
        let _guard = self.inner.lock.lock();
        self.inner.condvar.notify_all();
    }

    /// Register `wake` to run on cancellation. Runs it immediately if already cancelled.
    ///
    /// Long-lived tokens should [`forget`](Self::forget) wakers whose waiter has gone away.
    pub fn on_cancel(&self, wake: Waker) -> WakerId {
        let id = WakerId(self.inner.next_waker.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut wakers) = self.inner.wakers.lock() {
            if !self.is_cancelled() {
                wakers.push((id, wake));
                return id;
            }
        }
        wake();
        id
    }

    /// Drop the waker registered as `id`, if it has not run yet.
    pub fn forget(&self, id: WakerId) {
        let mut wakers = match self.inner.wakers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        wakers.retain(|(w, _)| *w != id);
    }

    #[cfg(test)]
    pub(crate) fn registered_wakers(&self) -> usize {
        self.inner.wakers.lock().map_or(0, |w| w.len())
    }

    /// Sleep for up to `timeout`, returning early (with `true`) if cancellation is requested.
    pub fn sleep(&self, timeout: std::time::Duration) -> bool {
        let guard = match self.inner.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let res = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled());
        drop(res);
        self.is_cancelled()
    }
}
