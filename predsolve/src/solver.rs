//! Host-facing entry points: patch the function at an address, or patch every function.
//!
//! Both come in a blocking form and a `spawn_*` form that runs on a detached, named thread so
//! that the triggering context never waits.

use crate::cancellation::CancellationToken;
use crate::convergence::{ConvergenceEngine, UnitOutcome, UnitStatus};
use crate::gateway::MutationGate;
use crate::host::{AnalysisUnit, ConditionOracle, ProgramModel, ReanalysisScope, TaskMonitor};
use crate::log::*;
use crate::orchestrator::{Orchestrator, SolveReport};
use crate::solver_config::SettingsProvider;
use crate::worker_pool::POLL_INTERVAL;
use crate::{Error, Result};

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Result of patching a single function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitReport {
    /// The function found at the requested address, if any.
    pub unit: Option<AnalysisUnit>,
    /// How processing went; `None` when there was no function.
    pub outcome: Option<UnitOutcome>,
    pub elapsed: Duration,
}

impl UnitReport {
    /// Patches applied, zero if nothing was processed.
    pub fn patches(&self) -> usize {
        self.outcome.as_ref().map_or(0, |o| o.patches)
    }
}

/// Patch every function until a global fixpoint, the global pass cap, or cancellation.
pub fn patch_all<M, O>(
    model: &M,
    oracle: &O,
    settings: &dyn SettingsProvider,
    monitor: &dyn TaskMonitor,
) -> Result<SolveReport>
where
    M: ProgramModel,
    O: ConditionOracle<M::Repr>,
{
    Orchestrator::new(model, oracle, settings, monitor).run()
}

/// Patch the function containing `address`, on the calling thread, without a worker pool.
pub fn patch_current_unit<M, O>(
    model: &M,
    oracle: &O,
    settings: &dyn SettingsProvider,
    monitor: &dyn TaskMonitor,
    address: u64,
) -> Result<UnitReport>
where
    M: ProgramModel,
    O: ConditionOracle<M::Repr>,
{
    let started = Instant::now();
    let unit = match model.unit_containing(address) {
        Some(u) => u,
        None => {
            warn!("No function at current address"; "address" => Addr(address));
            monitor.finish();
            return Ok(UnitReport {
                unit: None,
                outcome: None,
                elapsed: started.elapsed(),
            });
        }
    };

    let name = unit.display_name();
    info!("[+] Processing {}", name);
    monitor.report_progress(&format!("Patching {}", name));

    let config = settings.solver_config();
    let cancel = CancellationToken::new();
    let gate = MutationGate::new();
    let engine = ConvergenceEngine::new(model, oracle, &gate, &cancel, &config);

    if monitor.is_cancelled() {
        cancel.cancel();
    }
    // The engine only polls the token; a watcher forwards the monitor's flag into it.
    let done = CancellationToken::new();
    let outcome = std::thread::scope(|scope| {
        let watcher = std::thread::Builder::new()
            .name("predsolve-cancel-watch".into())
            .spawn_scoped(scope, || {
                while !cancel.is_cancelled() {
                    if monitor.is_cancelled() {
                        cancel.cancel();
                    } else if done.sleep(POLL_INTERVAL) {
                        break;
                    }
                }
            });
        if let Err(e) = &watcher {
            debug!("Cancellation watcher unavailable"; "error" => %e);
        }
        let outcome = engine.run(&unit, ReanalysisScope::Unit(unit.start));
        done.cancel();
        outcome
    });

    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;
    match outcome.status {
        UnitStatus::Cancelled => {
            warn!("[!] Cancelled: {} patches applied to {} before cancellation", outcome.patches, name;
                  "elapsed_ms" => elapsed_ms);
        }
        UnitStatus::CappedOut => {
            warn!("[!] Maximum passes reached: {} patches applied to {}", outcome.patches, name;
                  "elapsed_ms" => elapsed_ms);
        }
        UnitStatus::Converged | UnitStatus::Skipped(_) => {
            info!("[+] Completed: {} patches applied to {}", outcome.patches, name;
                  "elapsed_ms" => elapsed_ms);
        }
    }
    monitor.finish();

    Ok(UnitReport {
        unit: Some(unit),
        outcome: Some(outcome),
        elapsed,
    })
}

/// Run [`patch_all`] on a detached thread.
pub fn spawn_patch_all<M, O, S, T>(
    model: Arc<M>,
    oracle: Arc<O>,
    settings: Arc<S>,
    monitor: Arc<T>,
) -> Result<JoinHandle<Result<SolveReport>>>
where
    M: ProgramModel + Send + 'static,
    O: ConditionOracle<M::Repr> + Send + 'static,
    S: SettingsProvider + Send + 'static,
    T: TaskMonitor + Send + 'static,
{
    std::thread::Builder::new()
        .name("predsolve-all-functions".into())
        .spawn(move || patch_all(&*model, &*oracle, &*settings, &*monitor))
        .map_err(Error::ThreadSpawn)
}

/// Run [`patch_current_unit`] on a detached thread.
pub fn spawn_patch_current_unit<M, O, S, T>(
    model: Arc<M>,
    oracle: Arc<O>,
    settings: Arc<S>,
    monitor: Arc<T>,
    address: u64,
) -> Result<JoinHandle<Result<UnitReport>>>
where
    M: ProgramModel + Send + 'static,
    O: ConditionOracle<M::Repr> + Send + 'static,
    S: SettingsProvider + Send + 'static,
    T: TaskMonitor + Send + 'static,
{
    std::thread::Builder::new()
        .name("predsolve-current-function".into())
        .spawn(move || patch_current_unit(&*model, &*oracle, &*settings, &*monitor, address))
        .map_err(Error::ThreadSpawn)
}

/// Wait for a spawned run, turning a panic into an error.
pub fn join<R>(handle: JoinHandle<Result<R>>) -> Result<R> {
    handle
        .join()
        .map_err(|_| Error::WorkerPanicked("solver thread panicked".into()))?
}
