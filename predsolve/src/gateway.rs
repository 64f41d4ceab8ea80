//! The single serialization point for program mutation.
//!
//! Scans run concurrently, but applying patches and triggering re-analysis always happens while
//! holding the one [`MutationGate`] of a run. Re-analysis after a write can invalidate bookkeeping
//! for the whole program, so the gate is global rather than per unit.

use crate::host::{
    ConditionEvaluation, ExclusiveAccess, ProgramModel, ReanalysisScope, TargetContext,
};
use crate::log::*;
use crate::Result;
use std::sync::Mutex;

/// The exclusive mutation gate shared by every worker of a run.
#[derive(Default)]
pub struct MutationGate {
    lock: Mutex<()>,
}

impl MutationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate is free, and hold it for the lifetime of the returned token.
    pub fn acquire(&self) -> ExclusiveAccess<'_> {
        // The guarded value is `()`, so a poisoned gate carries no broken state.
        let guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        ExclusiveAccess { _guard: guard }
    }
}

/// The rewrite applied to a constant branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// The branch is never taken: replace it with a no-op.
    NeverBranch,
    /// The branch is always taken: replace it with an unconditional branch.
    AlwaysBranch,
}

impl PatchKind {
    /// The patch that a condition evaluation calls for, if any.
    pub fn for_evaluation(eval: ConditionEvaluation) -> Option<Self> {
        match eval {
            ConditionEvaluation::ConstantFalse => Some(Self::NeverBranch),
            ConditionEvaluation::ConstantTrue => Some(Self::AlwaysBranch),
            ConditionEvaluation::Unresolved => None,
        }
    }
}

/// A patch collected during a scan, waiting to be applied with the rest of its batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPatch {
    pub address: u64,
    pub kind: PatchKind,
    pub context: TargetContext,
}

/// Thin adapter between the engine and the host's mutation primitives.
pub struct PatchGateway<'a, M: ProgramModel> {
    model: &'a M,
    gate: &'a MutationGate,
}

impl<'a, M: ProgramModel> PatchGateway<'a, M> {
    pub fn new(model: &'a M, gate: &'a MutationGate) -> Self {
        Self { model, gate }
    }

    /// Ask the host's availability guard whether `kind` can be applied at `address`.
    pub fn is_available(&self, kind: PatchKind, context: &TargetContext, address: u64) -> bool {
        match kind {
            PatchKind::NeverBranch => self.model.can_apply_never_branch(context, address),
            PatchKind::AlwaysBranch => self.model.can_apply_always_branch(context, address),
        }
    }

    /// Apply a whole scan's worth of patches under one gate acquisition, in the given order, then
    /// re-analyze `scope`.
    ///
    /// Returns the number of patches the host accepted. Individual rejections are logged and do
    /// not stop the rest of the batch.
    pub fn apply_batch(&self, patches: &[PendingPatch], scope: ReanalysisScope) -> usize {
        if patches.is_empty() {
            return 0;
        }
        let access = self.gate.acquire();
        let mut applied = 0;
        for patch in patches {
            match self.apply_one(&access, patch) {
                Ok(()) => {
                    trace!("Patched"; "address" => Addr(patch.address), "kind" => ?patch.kind);
                    applied += 1;
                }
                Err(e) => {
                    error!("Patch failed"; "address" => Addr(patch.address), "error" => %e);
                }
            }
        }
        self.model.trigger_reanalysis(&access, scope);
        applied
    }

    /// Re-analyze `scope` without patching anything.
    pub fn refresh(&self, scope: ReanalysisScope) {
        let access = self.gate.acquire();
        self.model.trigger_reanalysis(&access, scope);
    }

    fn apply_one(&self, access: &ExclusiveAccess<'_>, patch: &PendingPatch) -> Result<()> {
        match patch.kind {
            PatchKind::NeverBranch => {
                self.model
                    .apply_never_branch(access, &patch.context, patch.address)
            }
            PatchKind::AlwaysBranch => {
                self.model
                    .apply_always_branch(access, &patch.context, patch.address)
            }
        }
    }
}
