//! The whole-program loop.
//!
//! Every global pass enumerates the functions afresh, runs them all through a new
//! [`WorkerPool`], and sums the patches. The loop stops at a global fixpoint (a pass applied
//! nothing), at the global pass cap, or on cancellation. Partial work is never rolled back.

use crate::cancellation::CancellationToken;
use crate::convergence::ConvergenceEngine;
use crate::gateway::{MutationGate, PatchGateway};
use crate::host::{AnalysisUnit, ConditionOracle, ProgramModel, ReanalysisScope, TaskMonitor};
use crate::log::*;
use crate::scheduler::BatchScheduler;
use crate::solver_config::{SettingsProvider, SolverConfig};
use crate::worker_pool::{PoolCounters, WorkerPool};
use crate::Result;

use std::time::{Duration, Instant};

/// Where the global loop is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// A full pass applied no patch: no resolvable opaque predicate is left.
    Converged,
    /// The global pass cap was reached while passes were still producing patches.
    CappedOut,
    /// Cancellation was requested; patches applied so far are kept.
    Cancelled,
}

/// Summary of one global pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalPassResult {
    /// 1-based pass number.
    pub pass: usize,
    /// Units enumerated for the pass.
    pub units: usize,
    /// Units fully handled before the pass ended.
    pub processed: usize,
    pub patches: usize,
    /// Units that hit the per-unit pass cap.
    pub capped_units: usize,
    pub skipped_units: usize,
    pub failed_units: usize,
    /// Units whose processing was interrupted by cancellation.
    pub cut_short_units: usize,
    /// Number of worker threads the pass ran with.
    pub threads: usize,
    /// The pass ended early because of cancellation.
    pub cancelled: bool,
}

/// The terminal report of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolveReport {
    pub state: RunState,
    pub passes: Vec<GlobalPassResult>,
    pub total_patches: usize,
    pub elapsed: Duration,
}

impl std::fmt::Display for SolveReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let outcome = match self.state {
            RunState::Running => "still running",
            RunState::Converged => "converged",
            RunState::CappedOut => "stopped at the global pass cap",
            RunState::Cancelled => "cancelled",
        };
        write!(
            f,
            "{} total patches applied over {} passes in {:.3}s ({})",
            self.total_patches,
            self.passes.len(),
            self.elapsed.as_secs_f64(),
            outcome
        )
    }
}

/// Runs global passes until the program stops changing.
pub struct Orchestrator<'a, M: ProgramModel, O: ConditionOracle<M::Repr>> {
    model: &'a M,
    oracle: &'a O,
    settings: &'a dyn SettingsProvider,
    monitor: &'a dyn TaskMonitor,
    cancel: CancellationToken,
    gate: MutationGate,
}

impl<'a, M: ProgramModel, O: ConditionOracle<M::Repr>> Orchestrator<'a, M, O> {
    pub fn new(
        model: &'a M,
        oracle: &'a O,
        settings: &'a dyn SettingsProvider,
        monitor: &'a dyn TaskMonitor,
    ) -> Self {
        Self {
            model,
            oracle,
            settings,
            monitor,
            cancel: CancellationToken::new(),
            gate: MutationGate::new(),
        }
    }

    /// A handle that cancels this run when raised, in addition to the monitor's flag.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run to a terminal state. The monitor is always finished, even on error.
    pub fn run(&self) -> Result<SolveReport> {
        let res = self.run_passes();
        self.monitor.finish();
        res
    }

    fn run_passes(&self) -> Result<SolveReport> {
        let started = Instant::now();
        info!("[+] Starting recursive patching for entire binary");

        let mut state = RunState::Running;
        let mut global_pass = 1;
        let mut total_patches = 0;
        let mut passes = vec![];

        while state == RunState::Running {
            if self.check_cancelled() {
                state = RunState::Cancelled;
                break;
            }

            // Re-read every pass so thread count changes take effect between passes.
            let config = self.settings.solver_config();
            let units = self.model.enumerate_units();
            if units.is_empty() {
                info!("No functions to process");
                state = RunState::Converged;
                break;
            }

            let result = self.run_pass(global_pass, units, &config)?;
            total_patches += result.patches;
            info!("[+] Pass {}: {} patches applied", result.pass, result.patches;
                  "functions" => result.units,
                  "processed" => result.processed,
                  "capped" => result.capped_units,
                  "skipped" => result.skipped_units,
                  "threads" => result.threads);
            let (cancelled, patches) = (result.cancelled, result.patches);
            passes.push(result);

            if cancelled {
                state = RunState::Cancelled;
            } else if patches == 0 {
                state = RunState::Converged;
            } else {
                global_pass += 1;
                if global_pass > config.max_global_passes {
                    state = RunState::CappedOut;
                } else {
                    PatchGateway::new(self.model, &self.gate).refresh(ReanalysisScope::Program);
                }
            }
        }

        let report = SolveReport {
            state,
            passes,
            total_patches,
            elapsed: started.elapsed(),
        };
        let elapsed_ms = report.elapsed.as_millis() as u64;
        match report.state {
            RunState::Converged => {
                info!("[+] Completed: {} total patches applied", report.total_patches;
                      "passes" => report.passes.len(), "elapsed_ms" => elapsed_ms);
            }
            RunState::CappedOut => {
                warn!("[!] Maximum passes reached: {} total patches applied", report.total_patches;
                      "passes" => report.passes.len(), "elapsed_ms" => elapsed_ms);
            }
            RunState::Cancelled => {
                warn!("[!] Cancelled: {} total patches applied before cancellation", report.total_patches;
                      "passes" => report.passes.len(), "elapsed_ms" => elapsed_ms);
            }
            RunState::Running => unreachable!("loop only exits in a terminal state"),
        }
        Ok(report)
    }

    fn run_pass(
        &self,
        pass: usize,
        units: Vec<AnalysisUnit>,
        config: &SolverConfig,
    ) -> Result<GlobalPassResult> {
        let total = units.len();
        let pool = WorkerPool::new(config.effective_worker_threads());
        debug!("Starting global pass"; "pass" => pass, "functions" => total, "threads" => pool.threads());

        let scheduler = BatchScheduler::with_units(units, self.cancel.clone());
        let counters = PoolCounters::default();
        let engine = ConvergenceEngine::new(self.model, self.oracle, &self.gate, &self.cancel, config);

        pool.run(&engine, &scheduler, &self.cancel, &counters, |c| {
            self.check_cancelled();
            let done = c.processed();
            self.monitor.report_progress(&format!(
                "Pass {}: {}/{} functions ({}%)",
                pass,
                done,
                total,
                done * 100 / total
            ));
        })?;

        let processed = counters.processed();
        let cut_short = counters.cut_short();
        Ok(GlobalPassResult {
            pass,
            units: total,
            processed,
            patches: counters.patches(),
            capped_units: counters.capped(),
            skipped_units: counters.skipped(),
            failed_units: counters.failed(),
            cut_short_units: cut_short,
            threads: pool.threads(),
            cancelled: self.cancel.is_cancelled() && (processed < total || cut_short > 0),
        })
    }

    /// Fold the monitor's flag into the run's token, waking blocked workers.
    fn check_cancelled(&self) -> bool {
        if !self.cancel.is_cancelled() && self.monitor.is_cancelled() {
            self.cancel.cancel();
        }
        self.cancel.is_cancelled()
    }
}
