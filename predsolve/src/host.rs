//! The boundary between the patch engine and whatever owns the program.
//!
//! The engine never touches program state directly. It enumerates units, borrows per-unit
//! representations, asks a [`ConditionOracle`] about branch conditions, and requests rewrites
//! through a [`ProgramModel`]. Mutating calls take an [`ExclusiveAccess`] token, which only the
//! crate's [`MutationGate`](crate::gateway::MutationGate) can hand out, so they cannot be issued
//! outside the gate.

use crate::Result;
use std::sync::Arc;

/// Architecture (or other target context) a patch is expressed in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetContext {
    pub architecture: Arc<str>,
}

impl TargetContext {
    pub fn new(architecture: impl AsRef<str>) -> Self {
        Self {
            architecture: Arc::from(architecture.as_ref()),
        }
    }
}

/// One function-level region of the program.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnalysisUnit {
    /// Entry address; the unit's identity.
    pub start: u64,
    /// Short symbol name, if the host knows one.
    pub name: Option<String>,
    /// Target context for patching; units without one are skipped.
    pub context: Option<TargetContext>,
}

impl AnalysisUnit {
    /// Name for display: the symbol name, or `sub_<start>`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("sub_{:x}", self.start),
        }
    }
}

/// A conditional branch within a representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BranchSite {
    /// Machine address of the branch instruction.
    pub address: u64,
    /// Position of the instruction within the representation it was scanned from.
    pub index: usize,
    /// Host-specific reference to the condition expression.
    pub condition: usize,
}

/// The analysis representation of a unit, valid until the next mutation.
pub trait Representation {
    /// Number of instructions to scan.
    fn instruction_count(&self) -> usize;
    /// The branch site at `index`, or `None` if that instruction is not a conditional branch.
    fn branch_site(&self, index: usize) -> Option<BranchSite>;
}

/// The outcome of evaluating one branch condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionEvaluation {
    /// No constant value could be established.
    Unresolved,
    /// The condition is always false; the branch is never taken.
    ConstantFalse,
    /// The condition is always true; the branch is always taken.
    ConstantTrue,
}

impl From<Option<u64>> for ConditionEvaluation {
    fn from(v: Option<u64>) -> Self {
        match v {
            None => Self::Unresolved,
            Some(0) => Self::ConstantFalse,
            Some(_) => Self::ConstantTrue,
        }
    }
}

/// Resolves branch conditions of a representation `R`.
pub trait ConditionOracle<R>: Sync {
    fn evaluate_condition(&self, repr: &R, site: &BranchSite) -> ConditionEvaluation;
}

/// How much of the program a re-analysis must cover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReanalysisScope {
    /// Only the unit starting at this address.
    Unit(u64),
    /// Everything.
    Program,
}

/// Proof of holding the exclusive mutation gate. Cannot be constructed outside this crate.
pub struct ExclusiveAccess<'g> {
    pub(crate) _guard: std::sync::MutexGuard<'g, ()>,
}

/// The host-owned, shared, mutable program.
///
/// All methods take `&self`: many workers scan concurrently, and the host is expected to use
/// interior mutability for the mutating calls, which are serialized by the gate anyway.
pub trait ProgramModel: Sync {
    /// Per-unit representation handle.
    type Repr: Representation;

    /// All units, in the host's order. May differ between calls.
    fn enumerate_units(&self) -> Vec<AnalysisUnit>;

    /// The unit containing `address`, if any.
    fn unit_containing(&self, address: u64) -> Option<AnalysisUnit>;

    /// The current representation of `unit`, if the host has one.
    fn representation(&self, unit: &AnalysisUnit) -> Option<Self::Repr>;

    /// Whether the branch at `address` can be turned into a no-op.
    fn can_apply_never_branch(&self, context: &TargetContext, address: u64) -> bool;

    /// Whether the branch at `address` can be turned into an unconditional branch.
    fn can_apply_always_branch(&self, context: &TargetContext, address: u64) -> bool;

    /// Turn the branch at `address` into a no-op.
    fn apply_never_branch(
        &self,
        access: &ExclusiveAccess<'_>,
        context: &TargetContext,
        address: u64,
    ) -> Result<()>;

    /// Turn the branch at `address` into an unconditional branch.
    fn apply_always_branch(
        &self,
        access: &ExclusiveAccess<'_>,
        context: &TargetContext,
        address: u64,
    ) -> Result<()>;

    /// Bring analysis results up to date after mutation.
    fn trigger_reanalysis(&self, access: &ExclusiveAccess<'_>, scope: ReanalysisScope);
}

/// The host's background-task handle.
pub trait TaskMonitor: Sync {
    /// Whether the user asked to stop.
    fn is_cancelled(&self) -> bool;
    /// Replace the task's progress text.
    fn report_progress(&self, text: &str);
    /// Mark the task as done.
    fn finish(&self);
}
