//! A small in-memory program model: functions of address-tagged instructions over named
//! variables.
//!
//! It is intentionally much simpler than a real decompiler IL, but it has the properties the
//! patch engine cares about: conditional branches whose conditions may fold to constants,
//! rewrites that change control flow, and a re-analysis step (reachability) whose result can
//! expose further constants.

use crate::error::Error;
use crate::host::{
    AnalysisUnit, BranchSite, ExclusiveAccess, ProgramModel, ReanalysisScope, Representation,
    TargetContext,
};
use crate::log::*;
use crate::Result;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use itertools::Itertools;

/// A binary operation. Comparisons produce `0` or `1` and are unsigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Equal,
    NotEqual,
    Less,
    LessEqual,
}

impl BinOp {
    /// Operator spellings, in the order the lifter tries them (longest first).
    pub const SPELLINGS: [(&'static str, BinOp); 12] = [
        ("==", BinOp::Equal),
        ("!=", BinOp::NotEqual),
        ("<=", BinOp::LessEqual),
        ("<<", BinOp::Shl),
        (">>", BinOp::Shr),
        ("<", BinOp::Less),
        ("+", BinOp::Add),
        ("-", BinOp::Sub),
        ("*", BinOp::Mul),
        ("&", BinOp::And),
        ("|", BinOp::Or),
        ("^", BinOp::Xor),
    ];

    pub fn spelling(self) -> &'static str {
        Self::SPELLINGS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(s, _)| *s)
            .unwrap_or("?")
    }

    /// Wrapping 64-bit evaluation.
    pub fn eval(self, a: u64, b: u64) -> u64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.checked_shl(b as u32).unwrap_or(0),
            BinOp::Shr => a.checked_shr(b as u32).unwrap_or(0),
            BinOp::Equal => (a == b) as u64,
            BinOp::NotEqual => (a != b) as u64,
            BinOp::Less => (a < b) as u64,
            BinOp::LessEqual => (a <= b) as u64,
        }
    }
}

/// An instruction operand.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Operand {
    /// A named variable (register, stack slot, ...).
    Var(String),
    Const(u64),
}

/// A value computed from operands.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Expr {
    Operand(Operand),
    Binary(BinOp, Operand, Operand),
}

/// An operation performed by an [`Instruction`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Op {
    /// `dst = expr`
    Assign { dst: String, expr: Expr },
    /// `dst` receives a value unknown to analysis (argument, load, call result)
    Input { dst: String },
    /// Branch to `target` iff `cond` is non-zero
    CondBranch { cond: Expr, target: u64 },
    /// Unconditional branch to `target`
    Branch { target: u64 },
    Nop,
    Return,
}

impl Op {
    /// The variable written, if any.
    pub fn defined_variable(&self) -> Option<&str> {
        match self {
            Op::Assign { dst, .. } | Op::Input { dst } => Some(dst),
            _ => None,
        }
    }
}

/// One instruction of a function.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Instruction {
    /// The address of the machine instruction.
    pub address: u64,
    pub op: Op,
}

/// A function of the listing.
#[derive(Clone, Debug)]
pub struct Function {
    /// Symbol name, if known.
    pub name: Option<String>,
    /// Entry address. Must be the address of one of `instructions` if there are any.
    pub entry: u64,
    /// Architecture, if known. Functions without one are never patched.
    pub architecture: Option<String>,
    /// Instructions in layout order; fallthrough goes to the next one.
    pub instructions: Vec<Instruction>,
    /// Result of the last re-analysis: which instructions are reachable from the entry.
    reachable: Vec<bool>,
}

impl Function {
    pub fn new(
        name: Option<String>,
        entry: u64,
        architecture: Option<String>,
        instructions: Vec<Instruction>,
    ) -> Self {
        let mut f = Self {
            name,
            entry,
            architecture,
            reachable: vec![false; instructions.len()],
            instructions,
        };
        f.reanalyze();
        f
    }

    fn index_of(&self, address: u64) -> Option<usize> {
        self.instructions.iter().position(|i| i.address == address)
    }

    /// Recompute reachability from the entry point.
    pub fn reanalyze(&mut self) {
        let mut reachable = vec![false; self.instructions.len()];
        let mut queue: VecDeque<usize> = self.index_of(self.entry).into_iter().collect();
        while let Some(i) = queue.pop_front() {
            if reachable[i] {
                continue;
            }
            reachable[i] = true;
            let fallthrough = i + 1 < self.instructions.len();
            match &self.instructions[i].op {
                Op::Return => {}
                Op::Branch { target } => queue.extend(self.index_of(*target)),
                Op::CondBranch { target, .. } => {
                    queue.extend(self.index_of(*target));
                    if fallthrough {
                        queue.push_back(i + 1);
                    }
                }
                Op::Assign { .. } | Op::Input { .. } | Op::Nop => {
                    if fallthrough {
                        queue.push_back(i + 1);
                    }
                }
            }
        }
        self.reachable = reachable;
    }

    /// Whether the instruction at `index` was reachable at the last re-analysis.
    pub fn is_reachable(&self, index: usize) -> bool {
        self.reachable.get(index).copied().unwrap_or(false)
    }

    /// Whether `address` lies within this function.
    pub fn contains(&self, address: u64) -> bool {
        address == self.entry || self.index_of(address).is_some()
    }

    fn unit(&self) -> AnalysisUnit {
        AnalysisUnit {
            start: self.entry,
            name: self.name.clone(),
            context: self.architecture.as_deref().map(TargetContext::new),
        }
    }

    /// A snapshot of the reachable instructions, as seen by the last re-analysis.
    pub fn view(&self) -> ListingView {
        let instructions: Vec<Instruction> = self
            .instructions
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_reachable(*i))
            .map(|(_, ins)| ins.clone())
            .collect();
        ListingView::new(self.entry, instructions)
    }
}

/// A program: a list of functions.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub functions: Vec<Function>,
}

impl Listing {
    pub fn new(functions: Vec<Function>) -> Self {
        Self { functions }
    }

    /// Find `(function index, instruction index)` for an instruction address.
    pub fn locate(&self, address: u64) -> Option<(usize, usize)> {
        self.functions
            .iter()
            .enumerate()
            .find_map(|(fi, f)| f.index_of(address).map(|ii| (fi, ii)))
    }

    /// The instruction at `address`, if any.
    pub fn instruction_at(&self, address: u64) -> Option<&Instruction> {
        self.locate(address)
            .map(|(fi, ii)| &self.functions[fi].instructions[ii])
    }

    /// The function whose entry is `entry`.
    pub fn function_at(&self, entry: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.entry == entry)
    }

    /// Recompute reachability for every function.
    pub fn reanalyze(&mut self) {
        for f in &mut self.functions {
            f.reanalyze();
        }
    }
}

fn fmt_operand(o: &Operand) -> String {
    match o {
        Operand::Var(v) => v.clone(),
        Operand::Const(c) => format!("{:#x}", c),
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Expr::Operand(o) => write!(f, "{}", fmt_operand(o)),
            Expr::Binary(op, a, b) => {
                write!(f, "{} {} {}", fmt_operand(a), op.spelling(), fmt_operand(b))
            }
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Op::Assign { dst, expr } => write!(f, "{} = {}", dst, expr),
            Op::Input { dst } => write!(f, "{} = input", dst),
            Op::CondBranch { cond, target } => write!(f, "if {} goto {:#x}", cond, target),
            Op::Branch { target } => write!(f, "goto {:#x}", target),
            Op::Nop => write!(f, "nop"),
            Op::Return => write!(f, "ret"),
        }
    }
}

/// Renders in the format understood by [`crate::lifter::lift_from`]. Instructions that the last
/// re-analysis found unreachable are marked with a `; dead` comment.
impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (n, func) in self.functions.iter().enumerate() {
            if n > 0 {
                writeln!(f)?;
            }
            let header = std::iter::once(format!("{:#x}", func.entry))
                .chain(std::iter::once(
                    func.name.clone().unwrap_or_else(|| "-".to_owned()),
                ))
                .chain(func.architecture.clone())
                .join(" ");
            writeln!(f, "function {}", header)?;
            for (i, ins) in func.instructions.iter().enumerate() {
                if func.is_reachable(i) {
                    writeln!(f, "  {:#x} {}", ins.address, ins.op)?;
                } else {
                    writeln!(f, "  {:#x} {} ; dead", ins.address, ins.op)?;
                }
            }
            writeln!(f, "end")?;
        }
        Ok(())
    }
}

/// The representation handed to the engine: the reachable instructions of one function, copied
/// out of the listing at the time of the request.
#[derive(Debug)]
pub struct ListingView {
    pub entry: u64,
    pub instructions: Vec<Instruction>,
    /// For each variable, the indices of the instructions defining it.
    definitions: BTreeMap<String, Vec<usize>>,
    /// Immediate dominator of each instruction; the entry maps to itself, and instructions not
    /// reached from the entry map to `None`.
    idom: Vec<Option<usize>>,
    /// Scratch space for [`crate::const_eval`].
    pub(crate) folded: Vec<std::cell::Cell<crate::const_eval::Folded>>,
}

impl ListingView {
    pub fn new(entry: u64, instructions: Vec<Instruction>) -> Self {
        let mut definitions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, ins) in instructions.iter().enumerate() {
            if let Some(v) = ins.op.defined_variable() {
                definitions.entry(v.to_owned()).or_default().push(i);
            }
        }
        let folded = instructions
            .iter()
            .map(|_| std::cell::Cell::new(crate::const_eval::Folded::Unknown))
            .collect();
        let idom = match instructions.iter().position(|i| i.address == entry) {
            Some(root) => immediate_dominators(&successors(&instructions), root),
            None => vec![None; instructions.len()],
        };
        Self {
            entry,
            instructions,
            definitions,
            idom,
            folded,
        }
    }

    /// Whether every path from the entry to instruction `b` goes through instruction `a` first.
    pub fn strictly_dominates(&self, a: usize, b: usize) -> bool {
        if a == b {
            return false;
        }
        let mut current = b;
        while let Some(parent) = self.idom.get(current).copied().flatten() {
            if parent == current {
                return false;
            }
            if parent == a {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Indices of the instructions in this view that write `var`.
    pub fn definitions_of(&self, var: &str) -> &[usize] {
        self.definitions
            .get(var)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Control-flow successors of each instruction of a view. The view keeps layout order, and the
/// layout successor of a reachable instruction that falls through is reachable too.
fn successors(instructions: &[Instruction]) -> Vec<Vec<usize>> {
    let index: BTreeMap<u64, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, ins)| (ins.address, i))
        .collect();
    let next = |i: usize| (i + 1 < instructions.len()).then(|| i + 1);
    instructions
        .iter()
        .enumerate()
        .map(|(i, ins)| match &ins.op {
            Op::Return => vec![],
            Op::Branch { target } => index.get(target).copied().into_iter().collect(),
            Op::CondBranch { target, .. } => index
                .get(target)
                .copied()
                .into_iter()
                .chain(next(i))
                .collect(),
            Op::Assign { .. } | Op::Input { .. } | Op::Nop => next(i).into_iter().collect(),
        })
        .collect()
}

/// Iterative immediate dominators (Cooper, Harvey and Kennedy) over reverse postorder.
fn immediate_dominators(succs: &[Vec<usize>], root: usize) -> Vec<Option<usize>> {
    let n = succs.len();
    let mut postorder = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    let mut stack = vec![(root, 0)];
    visited[root] = true;
    while let Some((node, child)) = stack.pop() {
        match succs[node].get(child) {
            Some(&next) => {
                stack.push((node, child + 1));
                if !visited[next] {
                    visited[next] = true;
                    stack.push((next, 0));
                }
            }
            None => postorder.push(node),
        }
    }

    let mut order = vec![usize::MAX; n];
    for (i, &node) in postorder.iter().enumerate() {
        order[node] = i;
    }
    let mut preds = vec![vec![]; n];
    for (node, ss) in succs.iter().enumerate() {
        if visited[node] {
            for &s in ss {
                preds[s].push(node);
            }
        }
    }

    let mut idom = vec![None; n];
    idom[root] = Some(root);
    let mut changed = true;
    while changed {
        changed = false;
        for &node in postorder.iter().rev().filter(|&&b| b != root) {
            let mut new_idom: Option<usize> = None;
            for &p in &preds[node] {
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(mut a) => {
                        let mut b = p;
                        while a != b {
                            while order[a] < order[b] {
                                a = idom[a].unwrap_or(root);
                            }
                            while order[b] < order[a] {
                                b = idom[b].unwrap_or(root);
                            }
                        }
                        a
                    }
                });
            }
            if new_idom.is_some() && idom[node] != new_idom {
                idom[node] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

impl Representation for ListingView {
    fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    fn branch_site(&self, index: usize) -> Option<BranchSite> {
        let ins = self.instructions.get(index)?;
        match ins.op {
            Op::CondBranch { .. } => Some(BranchSite {
                address: ins.address,
                index,
                condition: index,
            }),
            _ => None,
        }
    }
}

/// Counters describing what was done to a [`SharedListing`].
#[derive(Default, Debug)]
pub struct ListingStats {
    pub never_branch_patches: AtomicUsize,
    pub always_branch_patches: AtomicUsize,
    pub reanalyses: AtomicUsize,
}

/// A [`Listing`] that can be shared between the engine's threads.
pub struct SharedListing {
    listing: RwLock<Listing>,
    pub stats: ListingStats,
}

impl SharedListing {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing: RwLock::new(listing),
            stats: ListingStats::default(),
        }
    }

    /// Read access to the current listing.
    pub fn read(&self) -> RwLockReadGuard<'_, Listing> {
        match self.listing.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Listing> {
        match self.listing.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A copy of the current listing.
    pub fn snapshot(&self) -> Listing {
        self.read().clone()
    }

    /// Total patches applied so far.
    pub fn patches_applied(&self) -> usize {
        self.stats.never_branch_patches.load(Ordering::Acquire)
            + self.stats.always_branch_patches.load(Ordering::Acquire)
    }

    fn conditional_branch_at(&self, address: u64) -> Option<u64> {
        match self.read().instruction_at(address) {
            Some(Instruction {
                op: Op::CondBranch { target, .. },
                ..
            }) => Some(*target),
            _ => None,
        }
    }

    fn rewrite(&self, address: u64, f: impl FnOnce(&Op) -> Option<Op>) -> Result<()> {
        let mut listing = self.write();
        let (fi, ii) = listing.locate(address).ok_or_else(|| Error::PatchRejected {
            address,
            message: "no instruction at address".into(),
        })?;
        let ins = &mut listing.functions[fi].instructions[ii];
        match f(&ins.op) {
            Some(op) => {
                ins.op = op;
                Ok(())
            }
            None => Err(Error::PatchRejected {
                address,
                message: format!("not a conditional branch: {}", ins.op),
            }),
        }
    }
}

impl ProgramModel for SharedListing {
    type Repr = ListingView;

    fn enumerate_units(&self) -> Vec<AnalysisUnit> {
        self.read().functions.iter().map(Function::unit).collect()
    }

    fn unit_containing(&self, address: u64) -> Option<AnalysisUnit> {
        self.read()
            .functions
            .iter()
            .find(|f| f.contains(address))
            .map(Function::unit)
    }

    fn representation(&self, unit: &AnalysisUnit) -> Option<ListingView> {
        let listing = self.read();
        let f = listing.function_at(unit.start)?;
        if f.instructions.is_empty() {
            // Imports and other bodiless symbols
            return None;
        }
        Some(f.view())
    }

    fn can_apply_never_branch(&self, _context: &TargetContext, address: u64) -> bool {
        self.conditional_branch_at(address).is_some()
    }

    fn can_apply_always_branch(&self, _context: &TargetContext, address: u64) -> bool {
        match self.conditional_branch_at(address) {
            Some(target) => self.read().locate(target).is_some(),
            None => false,
        }
    }

    fn apply_never_branch(
        &self,
        _access: &ExclusiveAccess<'_>,
        _context: &TargetContext,
        address: u64,
    ) -> Result<()> {
        self.rewrite(address, |op| match op {
            Op::CondBranch { .. } => Some(Op::Nop),
            _ => None,
        })?;
        self.stats
            .never_branch_patches
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn apply_always_branch(
        &self,
        _access: &ExclusiveAccess<'_>,
        _context: &TargetContext,
        address: u64,
    ) -> Result<()> {
        self.rewrite(address, |op| match op {
            Op::CondBranch { target, .. } => Some(Op::Branch { target: *target }),
            _ => None,
        })?;
        self.stats
            .always_branch_patches
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn trigger_reanalysis(&self, _access: &ExclusiveAccess<'_>, scope: ReanalysisScope) {
        let mut listing = self.write();
        match scope {
            ReanalysisScope::Program => listing.reanalyze(),
            ReanalysisScope::Unit(entry) => {
                if let Some(f) = listing.functions.iter_mut().find(|f| f.entry == entry) {
                    f.reanalyze();
                }
            }
        }
        self.stats.reanalyses.fetch_add(1, Ordering::AcqRel);
        trace!("Re-analysis done"; "scope" => ?scope);
    }
}
