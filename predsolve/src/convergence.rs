//! Drive a single function to its local fixpoint.
//!
//! Each local pass scans the current representation, collects a patch for every branch whose
//! condition is constant and whose patch is available, applies the collected patches as one
//! batch, and re-fetches the representation. The loop ends when a scan collects nothing, when the
//! per-unit pass cap is reached, or on cancellation.

use crate::cancellation::CancellationToken;
use crate::gateway::{MutationGate, PatchGateway, PatchKind, PendingPatch};
use crate::host::{
    AnalysisUnit, ConditionOracle, ProgramModel, ReanalysisScope, Representation, TargetContext,
};
use crate::log::*;
use crate::solver_config::SolverConfig;

/// Number of scanned instructions between two cancellation checks within one scan.
pub const CANCEL_CHECK_INTERVAL: usize = 100;

/// Why a unit was not processed at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No architecture / target context.
    NoContext,
    /// The host has no representation for the unit.
    NoRepresentation,
    /// The representation has no instructions.
    EmptyRepresentation,
    /// The representation has instructions but no conditional branch.
    NoBranchSites,
}

/// How the local loop for a unit ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    /// A scan found nothing left to patch.
    Converged,
    /// The per-unit pass cap was reached while patches were still being produced.
    CappedOut,
    /// Cancellation was observed; already-applied batches are kept.
    Cancelled,
    /// The unit was never scanned.
    Skipped(SkipReason),
}

/// Accumulated result for one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitOutcome {
    /// Total patches applied to the unit.
    pub patches: usize,
    /// Number of scans performed.
    pub passes: usize,
    /// Patches applied by each scan-then-apply cycle, in order.
    pub pass_results: Vec<usize>,
    pub status: UnitStatus,
}

impl UnitOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            patches: 0,
            passes: 0,
            pass_results: vec![],
            status: UnitStatus::Skipped(reason),
        }
    }
}

/// The per-unit convergence loop. Shared by reference between all workers of a pass.
pub struct ConvergenceEngine<'a, M: ProgramModel, O: ConditionOracle<M::Repr>> {
    model: &'a M,
    oracle: &'a O,
    gateway: PatchGateway<'a, M>,
    cancel: &'a CancellationToken,
    config: &'a SolverConfig,
}

impl<'a, M: ProgramModel, O: ConditionOracle<M::Repr>> ConvergenceEngine<'a, M, O> {
    pub fn new(
        model: &'a M,
        oracle: &'a O,
        gate: &'a MutationGate,
        cancel: &'a CancellationToken,
        config: &'a SolverConfig,
    ) -> Self {
        Self {
            model,
            oracle,
            gateway: PatchGateway::new(model, gate),
            cancel,
            config,
        }
    }

    /// Run `unit` to its local fixpoint, re-analyzing `scope` after every applied batch.
    pub fn run(&self, unit: &AnalysisUnit, scope: ReanalysisScope) -> UnitOutcome {
        let context = match &unit.context {
            Some(c) => c,
            None => {
                warn!("No architecture for function"; "function" => unit.display_name(), "address" => Addr(unit.start));
                return UnitOutcome::skipped(SkipReason::NoContext);
            }
        };
        let mut repr = match self.model.representation(unit) {
            Some(r) => r,
            None => {
                warn!("No analysis representation for function"; "function" => unit.display_name(), "address" => Addr(unit.start));
                return UnitOutcome::skipped(SkipReason::NoRepresentation);
            }
        };
        if repr.instruction_count() == 0 {
            debug!("Empty function"; "function" => unit.display_name());
            return UnitOutcome::skipped(SkipReason::EmptyRepresentation);
        }
        if !(0..repr.instruction_count()).any(|i| repr.branch_site(i).is_some()) {
            trace!("No conditional branches"; "function" => unit.display_name());
            return UnitOutcome::skipped(SkipReason::NoBranchSites);
        }

        let max_passes = self.config.max_passes_per_unit;
        let mut outcome = UnitOutcome {
            patches: 0,
            passes: 0,
            pass_results: vec![],
            status: UnitStatus::Converged,
        };

        outcome.status = loop {
            if self.cancel.is_cancelled() {
                break UnitStatus::Cancelled;
            }
            if outcome.passes >= max_passes {
                break UnitStatus::CappedOut;
            }
            outcome.passes += 1;

            let pending = match self.scan(&repr, context) {
                Some(p) => p,
                None => break UnitStatus::Cancelled,
            };
            if pending.is_empty() {
                break UnitStatus::Converged;
            }

            let applied = self.gateway.apply_batch(&pending, scope);
            if self.config.log_individual_patches {
                for p in &pending {
                    info!("Patch"; "function" => unit.display_name(), "address" => Addr(p.address), "kind" => ?p.kind);
                }
            }
            debug!("Local pass done";
                   "function" => unit.display_name(),
                   "pass" => outcome.passes,
                   "collected" => pending.len(),
                   "applied" => applied);
            outcome.pass_results.push(applied);
            outcome.patches += applied;
            if applied == 0 {
                // Nothing changed, so the next scan would collect exactly the same patches.
                break UnitStatus::Converged;
            }

            repr = match self.model.representation(unit) {
                Some(r) => r,
                None => {
                    debug!("Representation gone after re-analysis"; "function" => unit.display_name());
                    break UnitStatus::Converged;
                }
            };
        };

        match outcome.status {
            UnitStatus::CappedOut => {
                warn!("[!] Maximum passes reached for function";
                      "function" => unit.display_name(),
                      "passes" => outcome.passes,
                      "patches" => outcome.patches);
            }
            UnitStatus::Cancelled => {
                debug!("Function processing cancelled"; "function" => unit.display_name(), "patches" => outcome.patches);
            }
            _ => {}
        }
        outcome
    }

    /// Collect the patches for one scan. Returns `None` if cancelled mid-scan; in that case
    /// nothing collected so far is applied.
    fn scan(&self, repr: &M::Repr, context: &TargetContext) -> Option<Vec<PendingPatch>> {
        let mut pending = vec![];
        for index in 0..repr.instruction_count() {
            if index > 0 && index % CANCEL_CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                return None;
            }
            let site = match repr.branch_site(index) {
                Some(s) => s,
                None => continue,
            };
            let kind = match PatchKind::for_evaluation(self.oracle.evaluate_condition(repr, &site))
            {
                Some(k) => k,
                None => continue,
            };
            if !self.gateway.is_available(kind, context, site.address) {
                if self.config.log_refused_patches {
                    info!("Patch not available"; "address" => Addr(site.address), "kind" => ?kind);
                }
                continue;
            }
            pending.push(PendingPatch {
                address: site.address,
                kind,
                context: context.clone(),
            });
        }
        Some(pending)
    }
}
