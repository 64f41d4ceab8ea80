//! Hand out units to workers in adaptively sized batches.

use crate::cancellation::{CancellationToken, WakerId};
use crate::host::AnalysisUnit;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// How many units to hand to a worker when `remaining` units are still queued.
///
/// Large batches amortize queue locking while there is plenty of work; near the tail, batches
/// shrink to single units so that slow units don't leave other workers idle.
pub fn batch_size_for(remaining: usize) -> usize {
    if remaining > 100 {
        5
    } else if remaining > 50 {
        3
    } else if remaining > 20 {
        2
    } else {
        1
    }
}

struct QueueState {
    queue: VecDeque<AnalysisUnit>,
    /// Producer has signaled that no more units will be pushed.
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl Shared {
    fn wake_all(&self) {
        // Take the lock so a waiter cannot miss the notification between its check and its wait.
        let _guard = self.state.lock();
        self.condvar.notify_all();
    }
}

/// The queue of units pending for the current global pass.
pub struct BatchScheduler {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    waker: WakerId,
}

impl BatchScheduler {
    /// An open, empty scheduler. Cancelling `cancel` wakes every blocked worker.
    pub fn new(cancel: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        });
        let weak = Arc::downgrade(&shared);
        let waker = cancel.on_cancel(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.wake_all();
            }
        }));
        Self {
            shared,
            cancel,
            waker,
        }
    }

    /// A scheduler pre-populated with `units` and already closed, as used for one global pass.
    pub fn with_units(units: Vec<AnalysisUnit>, cancel: CancellationToken) -> Self {
        let s = Self::new(cancel);
        s.push(units);
        s.close();
        s
    }

    /// Queue more units and wake waiting workers.
    pub fn push(&self, units: impl IntoIterator<Item = AnalysisUnit>) {
        let mut state = self.lock_state();
        state.queue.extend(units);
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// Signal that no more units will be pushed.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.shared.condvar.notify_all();
    }

    /// Number of units not yet handed out.
    pub fn remaining(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// The next batch of units, or `None` once the queue is drained and closed, or on
    /// cancellation. Blocks while the queue is empty but still open.
    pub fn next_batch(&self) -> Option<Vec<AnalysisUnit>> {
        let mut state = self.lock_state();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if !state.queue.is_empty() {
                let n = batch_size_for(state.queue.len()).min(state.queue.len());
                return Some(state.queue.drain(..n).collect());
            }
            if state.closed {
                return None;
            }
            state = match self.shared.condvar.wait(state) {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Every critical section leaves the queue consistent, so poisoning can be ignored.
        match self.shared.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        // The run's token outlives every pass's scheduler.
        self.cancel.forget(self.waker);
    }
}
