//! On-demand constant evaluation of branch conditions over a [`ListingView`].
//!
//! A variable is constant at a use if exactly one reachable instruction of the function defines
//! it, that definition strictly dominates the use, and the definition itself folds to a constant.
//! Results are memoized per view, so a scan evaluates each definition at most once no matter how
//! many branches read it.

use crate::host::{BranchSite, ConditionEvaluation, ConditionOracle};
use crate::listing::{Expr, ListingView, Op, Operand};
use crate::log::*;

/// Memoized state of one definition in a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Folded {
    Unknown,
    SentinelForRecursion,
    Dynamic,
    Constant(u64),
}

/// The condition oracle for listings.
#[derive(Default, Debug)]
pub struct ConstEvaluator;

impl ConstEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// The constant value of `expr` when read by instruction `at` of `view`, if there is one.
    pub fn eval_expr(&self, view: &ListingView, expr: &Expr, at: usize) -> Option<u64> {
        match expr {
            Expr::Operand(o) => self.eval_operand(view, o, at),
            Expr::Binary(op, a, b) => {
                let a = self.eval_operand(view, a, at)?;
                let b = self.eval_operand(view, b, at)?;
                Some(op.eval(a, b))
            }
        }
    }

    fn eval_operand(&self, view: &ListingView, operand: &Operand, at: usize) -> Option<u64> {
        match operand {
            Operand::Const(c) => Some(*c),
            Operand::Var(v) => match view.definitions_of(v) {
                [def] if view.strictly_dominates(*def, at) => self.output_at(view, *def),
                // Never defined here (an argument), defined along several paths, or read before
                // the definition on some path.
                _ => None,
            },
        }
    }

    /// The constant written by the instruction at `index`, if it is one.
    fn output_at(&self, view: &ListingView, index: usize) -> Option<u64> {
        let cell = &view.folded[index];
        match cell.get() {
            Folded::Unknown => cell.set(Folded::SentinelForRecursion),
            // A definition depending on itself (`i = i + 1`) is not constant.
            Folded::SentinelForRecursion | Folded::Dynamic => {
                cell.set(Folded::Dynamic);
                return None;
            }
            Folded::Constant(c) => return Some(c),
        }
        let res = match &view.instructions[index].op {
            Op::Assign { expr, .. } => self.eval_expr(view, expr, index),
            Op::Input { .. } => None,
            op => {
                debug!("Not a definition"; "op" => %op);
                None
            }
        };
        cell.set(match res {
            Some(c) => Folded::Constant(c),
            None => Folded::Dynamic,
        });
        res
    }
}

impl ConditionOracle<ListingView> for ConstEvaluator {
    fn evaluate_condition(&self, view: &ListingView, site: &BranchSite) -> ConditionEvaluation {
        match view.instructions.get(site.condition).map(|i| &i.op) {
            Some(Op::CondBranch { cond, .. }) => {
                self.eval_expr(view, cond, site.condition).into()
            }
            _ => ConditionEvaluation::Unresolved,
        }
    }
}
