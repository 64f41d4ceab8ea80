//! A fixed set of worker threads for one global pass.
//!
//! Workers pull batches from the [`BatchScheduler`] and run every unit of a batch, in order,
//! through the [`ConvergenceEngine`]. Scans run in parallel; patch application funnels through
//! the engine's single mutation gate. The calling thread stays behind as the monitor: it polls
//! the shared counters every [`POLL_INTERVAL`] until all workers have exited, then joins them.

use crate::cancellation::CancellationToken;
use crate::convergence::{ConvergenceEngine, UnitOutcome, UnitStatus};
use crate::host::{AnalysisUnit, ConditionOracle, ProgramModel, ReanalysisScope};
use crate::log::*;
use crate::scheduler::BatchScheduler;
use crate::{Error, Result};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// How often the monitoring thread wakes up while workers are running.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters shared by the workers of one pass. All of them only ever grow.
#[derive(Default, Debug)]
pub struct PoolCounters {
    processed: AtomicUsize,
    patches: AtomicUsize,
    capped: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    cut_short: AtomicUsize,
}

impl PoolCounters {
    /// Units whose processing has finished (including skipped ones).
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    /// Patches applied so far.
    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::Acquire)
    }

    /// Units that hit the per-unit pass cap.
    pub fn capped(&self) -> usize {
        self.capped.load(Ordering::Acquire)
    }

    /// Units skipped for lack of a representation or context.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Acquire)
    }

    /// Units whose processing panicked inside the host.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// Units that stopped early because of cancellation, and may still hold constant branches.
    pub fn cut_short(&self) -> usize {
        self.cut_short.load(Ordering::Acquire)
    }

    fn record(&self, outcome: &UnitOutcome) {
        match outcome.status {
            UnitStatus::CappedOut => {
                self.capped.fetch_add(1, Ordering::AcqRel);
            }
            UnitStatus::Skipped(_) => {
                self.skipped.fetch_add(1, Ordering::AcqRel);
            }
            UnitStatus::Cancelled => {
                self.cut_short.fetch_add(1, Ordering::AcqRel);
            }
            UnitStatus::Converged => {}
        }
        // Patches before processed, so an observer never sees a unit counted without its patches.
        self.patches.fetch_add(outcome.patches, Ordering::AcqRel);
        self.processed.fetch_add(1, Ordering::AcqRel);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.processed.fetch_add(1, Ordering::AcqRel);
    }
}

/// A pool of `threads` workers, alive for one call to [`WorkerPool::run`].
pub struct WorkerPool {
    threads: usize,
}

impl WorkerPool {
    /// A pool of `threads` workers; `0` is treated as `1`.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run workers until `scheduler` is drained and closed, or until `cancel` is raised.
    ///
    /// `poll` is called from the calling thread roughly every [`POLL_INTERVAL`] while workers run,
    /// and once more after they have all been joined. Every worker is joined before this returns,
    /// whatever the outcome.
    pub fn run<M, O>(
        &self,
        engine: &ConvergenceEngine<'_, M, O>,
        scheduler: &BatchScheduler,
        cancel: &CancellationToken,
        counters: &PoolCounters,
        mut poll: impl FnMut(&PoolCounters),
    ) -> Result<()>
    where
        M: ProgramModel,
        O: ConditionOracle<M::Repr>,
    {
        let (alive_tx, alive_rx) = mpsc::channel::<()>();

        let (spawn_error, panics) = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.threads);
            let mut spawn_error = None;
            for id in 0..self.threads {
                let alive = alive_tx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("predsolve-worker-{}", id))
                    .spawn_scoped(scope, move || {
                        // Dropped on exit, panicking or not; the monitor watches for disconnect.
                        let _alive = alive;
                        worker_loop(id, engine, scheduler, cancel, counters)
                    });
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        error!("Failed to spawn worker"; "worker" => id, "error" => %e);
                        spawn_error = Some(e);
                        break;
                    }
                }
            }
            drop(alive_tx);

            if handles.is_empty() {
                return (spawn_error, vec![]);
            }

            loop {
                match alive_rx.recv_timeout(POLL_INTERVAL) {
                    Err(mpsc::RecvTimeoutError::Timeout) => poll(counters),
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Ok(()) => {}
                }
            }

            let panics: Vec<String> = handles
                .into_iter()
                .filter_map(|h| h.join().err())
                .map(|payload| panic_message(&*payload))
                .collect();
            (None, panics)
        });
        poll(counters);

        if let Some(e) = spawn_error {
            return Err(Error::ThreadSpawn(e));
        }
        if let Some(msg) = panics.into_iter().next() {
            return Err(Error::WorkerPanicked(msg));
        }
        Ok(())
    }
}

fn worker_loop<M, O>(
    id: usize,
    engine: &ConvergenceEngine<'_, M, O>,
    scheduler: &BatchScheduler,
    cancel: &CancellationToken,
    counters: &PoolCounters,
) where
    M: ProgramModel,
    O: ConditionOracle<M::Repr>,
{
    trace!("Worker started"; "worker" => id);
    let mut units = 0usize;
    'batches: while let Some(batch) = scheduler.next_batch() {
        for unit in batch {
            if cancel.is_cancelled() {
                break 'batches;
            }
            process_unit(engine, &unit, counters);
            units += 1;
        }
    }
    trace!("Worker exiting"; "worker" => id, "units" => units);
}

fn process_unit<M, O>(
    engine: &ConvergenceEngine<'_, M, O>,
    unit: &AnalysisUnit,
    counters: &PoolCounters,
) where
    M: ProgramModel,
    O: ConditionOracle<M::Repr>,
{
    match catch_unwind(AssertUnwindSafe(|| {
        engine.run(unit, ReanalysisScope::Program)
    })) {
        Ok(outcome) => {
            if outcome.patches > 0 {
                debug!("Function patched";
                       "function" => unit.display_name(),
                       "patches" => outcome.patches,
                       "passes" => outcome.passes);
            }
            counters.record(&outcome);
        }
        Err(payload) => {
            error!("Processing function panicked";
                   "address" => Addr(unit.start),
                   OptionalKV("name", unit.name.clone()),
                   "panic" => panic_message(&*payload));
            counters.record_failure();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
