use crate::cancellation::CancellationToken;
use crate::const_eval::ConstEvaluator;
use crate::convergence::{ConvergenceEngine, SkipReason, UnitStatus};
use crate::gateway::MutationGate;
use crate::host::{
    AnalysisUnit, BranchSite, ConditionEvaluation, ConditionOracle, ExclusiveAccess,
    ProgramModel, ReanalysisScope, Representation, TargetContext, TaskMonitor,
};
use crate::lifter::lift_from;
use crate::listing::{Op, SharedListing};
use crate::monitor::LoggingMonitor;
use crate::orchestrator::{Orchestrator, RunState, SolveReport};
use crate::scheduler::BatchScheduler;
use crate::solver::{patch_all, patch_current_unit};
use crate::solver_config::{GlobalSettings, SettingsProvider, SolverConfig};
use crate::worker_pool::{PoolCounters, WorkerPool};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ConditionEvaluation::{ConstantFalse, ConstantTrue, Unresolved};

const UNIT_STRIDE: u64 = 0x10_0000;
const GENERATION_STRIDE: u64 = 0x1000;

/// What a scripted unit's representation looks like as it gets patched.
#[derive(Clone, Debug)]
enum Script {
    /// Branch sites for each generation; generations past the end have none.
    Generations(Vec<Vec<ConditionEvaluation>>),
    /// A single constant site, no matter how often it is patched.
    Endless,
}

struct ScriptedUnit {
    unit: AnalysisUnit,
    script: Script,
    /// Non-branch instructions after the branch sites.
    filler: usize,
    panics: bool,
    generation: AtomicUsize,
    dirty: AtomicBool,
    representation_calls: AtomicUsize,
}

/// A representation whose first `sites.len()` instructions are branch sites.
struct ScriptedRepr {
    start: u64,
    generation: usize,
    sites: Vec<ConditionEvaluation>,
    len: usize,
}

impl Representation for ScriptedRepr {
    fn instruction_count(&self) -> usize {
        self.len
    }

    fn branch_site(&self, index: usize) -> Option<BranchSite> {
        (index < self.sites.len()).then(|| BranchSite {
            address: self.start + self.generation as u64 * GENERATION_STRIDE + index as u64,
            index,
            condition: index,
        })
    }
}

/// A host that follows per-unit scripts and counts everything done to it.
#[derive(Default)]
struct ScriptedModel {
    units: Vec<ScriptedUnit>,
    refused: Vec<u64>,
    mutations: AtomicUsize,
    reanalyses: AtomicUsize,
    in_gate: AtomicUsize,
    max_in_gate: AtomicUsize,
    open_batch: Mutex<Vec<u64>>,
    batches: Mutex<Vec<Vec<u64>>>,
}

impl ScriptedModel {
    fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, script: Script, filler: usize) -> &mut Self {
        let start = (self.units.len() as u64 + 1) * UNIT_STRIDE;
        self.units.push(ScriptedUnit {
            unit: AnalysisUnit {
                start,
                name: None,
                context: Some(TargetContext::new("x86_64")),
            },
            script,
            filler,
            panics: false,
            generation: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            representation_calls: AtomicUsize::new(0),
        });
        self
    }

    fn with_units(n: usize, script: Script, filler: usize) -> Self {
        let mut m = Self::new();
        for _ in 0..n {
            m.add(script.clone(), filler);
        }
        m
    }

    fn last_mut(&mut self) -> &mut ScriptedUnit {
        self.units.last_mut().unwrap()
    }

    fn scripted(&self, start: u64) -> Option<&ScriptedUnit> {
        self.units.iter().find(|u| u.unit.start == start)
    }

    fn owner_of(&self, address: u64) -> Option<&ScriptedUnit> {
        self.scripted(address / UNIT_STRIDE * UNIT_STRIDE)
    }

    fn record_mutation(&self, address: u64) -> crate::Result<()> {
        let inside = self.in_gate.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_gate.fetch_max(inside, Ordering::SeqCst);
        std::thread::yield_now();
        self.mutations.fetch_add(1, Ordering::SeqCst);
        if let Some(u) = self.owner_of(address) {
            u.dirty.store(true, Ordering::SeqCst);
        }
        self.open_batch.lock().unwrap().push(address);
        self.in_gate.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn batches(&self) -> Vec<Vec<u64>> {
        self.batches.lock().unwrap().clone()
    }
}

impl ProgramModel for ScriptedModel {
    type Repr = ScriptedRepr;

    fn enumerate_units(&self) -> Vec<AnalysisUnit> {
        self.units.iter().map(|u| u.unit.clone()).collect()
    }

    fn unit_containing(&self, address: u64) -> Option<AnalysisUnit> {
        self.owner_of(address).map(|u| u.unit.clone())
    }

    fn representation(&self, unit: &AnalysisUnit) -> Option<ScriptedRepr> {
        let u = self.scripted(unit.start)?;
        u.representation_calls.fetch_add(1, Ordering::SeqCst);
        if u.panics {
            panic!("scripted failure in {}", unit.display_name());
        }
        let generation = u.generation.load(Ordering::SeqCst);
        let sites = match &u.script {
            Script::Generations(g) => g.get(generation).cloned().unwrap_or_default(),
            Script::Endless => vec![ConstantTrue],
        };
        Some(ScriptedRepr {
            start: unit.start,
            generation,
            len: sites.len() + u.filler,
            sites,
        })
    }

    fn can_apply_never_branch(&self, _context: &TargetContext, address: u64) -> bool {
        !self.refused.contains(&address)
    }

    fn can_apply_always_branch(&self, _context: &TargetContext, address: u64) -> bool {
        !self.refused.contains(&address)
    }

    fn apply_never_branch(
        &self,
        _access: &ExclusiveAccess<'_>,
        _context: &TargetContext,
        address: u64,
    ) -> crate::Result<()> {
        self.record_mutation(address)
    }

    fn apply_always_branch(
        &self,
        _access: &ExclusiveAccess<'_>,
        _context: &TargetContext,
        address: u64,
    ) -> crate::Result<()> {
        self.record_mutation(address)
    }

    fn trigger_reanalysis(&self, _access: &ExclusiveAccess<'_>, scope: ReanalysisScope) {
        self.reanalyses.fetch_add(1, Ordering::SeqCst);
        for u in &self.units {
            let in_scope = match scope {
                ReanalysisScope::Program => true,
                ReanalysisScope::Unit(start) => u.unit.start == start,
            };
            if in_scope && u.dirty.swap(false, Ordering::SeqCst) {
                u.generation.fetch_add(1, Ordering::SeqCst);
            }
        }
        let batch = std::mem::take(&mut *self.open_batch.lock().unwrap());
        if !batch.is_empty() {
            self.batches.lock().unwrap().push(batch);
        }
    }
}

/// Answers from the representation's script, optionally cancelling a token after some calls.
#[derive(Default)]
struct ScriptedOracle {
    calls: AtomicUsize,
    delay: Option<Duration>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ConditionOracle<ScriptedRepr> for ScriptedOracle {
    fn evaluate_condition(&self, repr: &ScriptedRepr, site: &BranchSite) -> ConditionEvaluation {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if calls >= *after {
                token.cancel();
            }
        }
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
        repr.sites[site.condition]
    }
}

fn config(threads: usize) -> SolverConfig {
    SolverConfig {
        worker_threads: threads,
        ..Default::default()
    }
}

fn run_all(model: &ScriptedModel, oracle: &ScriptedOracle, config: &SolverConfig) -> SolveReport {
    let monitor = LoggingMonitor::new();
    let report = patch_all(model, oracle, config, &monitor).unwrap();
    assert!(monitor.is_finished());
    report
}

fn run_unit(
    model: &ScriptedModel,
    oracle: &ScriptedOracle,
    config: &SolverConfig,
) -> crate::convergence::UnitOutcome {
    let gate = MutationGate::new();
    let cancel = CancellationToken::new();
    let engine = ConvergenceEngine::new(model, oracle, &gate, &cancel, config);
    let unit = &model.units[0].unit;
    engine.run(unit, ReanalysisScope::Unit(unit.start))
}

#[test]
fn single_never_branch_converges_after_two_scans() {
    let model = ScriptedModel::with_units(1, Script::Generations(vec![vec![ConstantFalse]]), 4);
    let oracle = ScriptedOracle::default();
    let outcome = run_unit(&model, &oracle, &config(1));

    assert_eq!(outcome.patches, 1);
    assert_eq!(outcome.passes, 2);
    assert_eq!(outcome.pass_results, vec![1]);
    assert_eq!(outcome.status, UnitStatus::Converged);
    assert_eq!(model.mutations.load(Ordering::SeqCst), 1);
    assert_eq!(model.reanalyses.load(Ordering::SeqCst), 1);
}

#[test]
fn unit_without_branches_touches_nothing() {
    let model = ScriptedModel::with_units(1, Script::Generations(vec![]), 3);
    let oracle = ScriptedOracle::default();
    let outcome = run_unit(&model, &oracle, &config(1));

    assert_eq!(outcome.patches, 0);
    assert_eq!(outcome.passes, 0);
    assert_eq!(outcome.status, UnitStatus::Skipped(SkipReason::NoBranchSites));
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    assert_eq!(model.mutations.load(Ordering::SeqCst), 0);
    assert_eq!(model.reanalyses.load(Ordering::SeqCst), 0);
}

#[test]
fn three_units_converge_in_two_global_passes() {
    let model = ScriptedModel::with_units(3, Script::Generations(vec![vec![ConstantTrue]]), 2);
    let oracle = ScriptedOracle::default();
    let report = run_all(&model, &oracle, &config(2));

    assert_eq!(report.state, RunState::Converged);
    assert_eq!(report.total_patches, 3);
    assert_eq!(
        report.passes.iter().map(|p| p.patches).collect::<Vec<_>>(),
        vec![3, 0]
    );
    assert!(report.passes.iter().all(|p| p.processed == 3 && !p.cancelled));
}

#[test]
fn pathological_unit_stops_at_the_pass_cap() {
    let model = ScriptedModel::with_units(1, Script::Endless, 0);
    let oracle = ScriptedOracle::default();
    let cfg = SolverConfig {
        max_passes_per_unit: 2,
        ..config(1)
    };
    let outcome = run_unit(&model, &oracle, &cfg);

    assert_eq!(outcome.status, UnitStatus::CappedOut);
    assert_eq!(outcome.passes, 2);
    assert_eq!(outcome.patches, 2);
}

#[test]
fn cancellation_mid_pass_stops_early() {
    let mut model = ScriptedModel::new();
    for _ in 0..200 {
        model.add(Script::Generations(vec![vec![ConstantFalse]]), 1);
    }
    let monitor = LoggingMonitor::new();
    let cfg = config(1);
    let token = CancellationToken::new();
    let oracle = ScriptedOracle {
        cancel_after: Some((30, token.clone())),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(&model, &oracle, &cfg, &monitor);
    let run_token = orchestrator.cancellation_token();
    token.on_cancel(Arc::new(move || run_token.cancel()));
    let report = orchestrator.run().unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(report.passes.len(), 1);
    let pass = &report.passes[0];
    assert!(pass.cancelled);
    assert!(pass.processed < 200);
    assert!(pass.processed >= 30);
    assert!(monitor.is_finished());
}

#[test]
fn unit_cut_short_by_cancellation_cancels_the_run() {
    // The only unit is counted as processed, but its scan never finished.
    let sites = vec![ConstantFalse; 500];
    let model = ScriptedModel::with_units(1, Script::Generations(vec![sites]), 0);
    let monitor = LoggingMonitor::new();
    let cfg = config(1);
    let token = CancellationToken::new();
    let oracle = ScriptedOracle {
        cancel_after: Some((150, token.clone())),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(&model, &oracle, &cfg, &monitor);
    let run_token = orchestrator.cancellation_token();
    token.on_cancel(Arc::new(move || run_token.cancel()));
    let report = orchestrator.run().unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    let pass = &report.passes[0];
    assert_eq!(pass.processed, 1);
    assert_eq!(pass.cut_short_units, 1);
    assert!(pass.cancelled);
    assert_eq!(report.total_patches, 0);
    assert_eq!(model.mutations.load(Ordering::SeqCst), 0);
}

#[test]
fn cancelled_scans_are_never_partially_applied() {
    // 250 constant sites per unit: a scan checks for cancellation twice along the way.
    let sites = vec![ConstantFalse; 250];
    let model = ScriptedModel::with_units(40, Script::Generations(vec![sites]), 0);
    let cfg = config(4);
    let monitor = LoggingMonitor::new();
    let token = CancellationToken::new();
    let oracle = ScriptedOracle {
        cancel_after: Some((1234, token.clone())),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(&model, &oracle, &cfg, &monitor);
    let run_token = orchestrator.cancellation_token();
    token.on_cancel(Arc::new(move || run_token.cancel()));
    let report = orchestrator.run().unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    let batches = model.batches();
    assert!(batches.len() < 40);
    for batch in &batches {
        assert_eq!(batch.len(), 250, "partial batch applied");
        let owner = batch[0] / UNIT_STRIDE;
        assert!(batch.iter().all(|a| a / UNIT_STRIDE == owner));
    }
    assert_eq!(
        model.mutations.load(Ordering::SeqCst),
        batches.len() * 250
    );
}

#[test]
fn every_unit_is_processed_exactly_once() {
    let model = ScriptedModel::with_units(777, Script::Generations(vec![]), 1);
    let oracle = ScriptedOracle::default();
    let report = run_all(&model, &oracle, &config(8));

    assert_eq!(report.state, RunState::Converged);
    assert_eq!(report.passes[0].processed, 777);
    for u in &model.units {
        assert_eq!(u.representation_calls.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn counters_only_grow() {
    let model = ScriptedModel::with_units(100, Script::Generations(vec![vec![ConstantTrue]]), 0);
    let oracle = ScriptedOracle {
        delay: Some(Duration::from_millis(3)),
        ..Default::default()
    };
    let cfg = config(2);
    let gate = MutationGate::new();
    let cancel = CancellationToken::new();
    let engine = ConvergenceEngine::new(&model, &oracle, &gate, &cancel, &cfg);
    let scheduler = BatchScheduler::with_units(model.enumerate_units(), cancel.clone());
    let counters = PoolCounters::default();

    let mut seen = vec![];
    WorkerPool::new(2)
        .run(&engine, &scheduler, &cancel, &counters, |c| {
            seen.push((c.processed(), c.patches()))
        })
        .unwrap();

    assert!(seen.len() >= 2, "monitor should have polled while workers ran");
    for w in seen.windows(2) {
        assert!(w[0].0 <= w[1].0 && w[0].1 <= w[1].1, "{:?}", w);
    }
    assert_eq!(seen.last(), Some(&(100, 100)));
}

#[test]
fn scan_apply_cycles_are_bounded_by_the_cap() {
    for cap in [0, 1, 3, 7] {
        let model = ScriptedModel::with_units(1, Script::Endless, 5);
        let oracle = ScriptedOracle::default();
        let cfg = SolverConfig {
            max_passes_per_unit: cap,
            ..config(1)
        };
        let outcome = run_unit(&model, &oracle, &cfg);
        assert_eq!(outcome.status, UnitStatus::CappedOut);
        assert_eq!(outcome.passes, cap);
        assert_eq!(model.mutations.load(Ordering::SeqCst), cap);
    }
}

#[test]
fn global_pass_cap_is_reported_not_an_error() {
    let model = ScriptedModel::with_units(2, Script::Endless, 0);
    let oracle = ScriptedOracle::default();
    let cfg = SolverConfig {
        max_passes_per_unit: 2,
        max_global_passes: 3,
        ..config(2)
    };
    let report = run_all(&model, &oracle, &cfg);

    assert_eq!(report.state, RunState::CappedOut);
    assert_eq!(report.passes.len(), 3);
    assert_eq!(report.total_patches, 12);
    assert!(report.passes.iter().all(|p| p.capped_units == 2));
}

#[test]
fn mutations_never_overlap() {
    let model = ScriptedModel::with_units(
        64,
        Script::Generations(vec![vec![ConstantTrue; 3], vec![ConstantFalse]]),
        2,
    );
    let oracle = ScriptedOracle::default();
    let report = run_all(&model, &oracle, &config(8));

    assert_eq!(report.state, RunState::Converged);
    assert_eq!(report.total_patches, 64 * 4);
    assert_eq!(model.max_in_gate.load(Ordering::SeqCst), 1);
    // One batch per scan that found something.
    assert_eq!(model.batches().len(), 64 * 2);
}

#[test]
fn refused_sites_are_dropped_for_the_pass() {
    let sites = vec![ConstantTrue, ConstantFalse];
    let mut model = ScriptedModel::with_units(1, Script::Generations(vec![sites]), 0);
    let start = model.units[0].unit.start;
    model.refused.push(start + 1);
    let oracle = ScriptedOracle::default();
    let outcome = run_unit(&model, &oracle, &config(1));

    assert_eq!(outcome.patches, 1);
    assert_eq!(model.batches(), vec![vec![start]]);
}

#[test]
fn unresolved_sites_are_left_alone() {
    let model = ScriptedModel::with_units(1, Script::Generations(vec![vec![Unresolved; 5]]), 0);
    let oracle = ScriptedOracle::default();
    let outcome = run_unit(&model, &oracle, &config(1));

    assert_eq!(outcome.patches, 0);
    assert_eq!(outcome.passes, 1);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 5);
    assert_eq!(model.mutations.load(Ordering::SeqCst), 0);
}

#[test]
fn panicking_unit_does_not_take_down_the_pass() {
    let mut model = ScriptedModel::with_units(5, Script::Generations(vec![vec![ConstantTrue]]), 0);
    model.add(Script::Endless, 0);
    model.last_mut().panics = true;
    let oracle = ScriptedOracle::default();
    let report = run_all(&model, &oracle, &config(3));

    assert_eq!(report.state, RunState::Converged);
    assert_eq!(report.total_patches, 5);
    assert!(report.passes.iter().all(|p| p.failed_units == 1));
}

#[test]
fn units_without_context_are_skipped() {
    let mut model = ScriptedModel::with_units(2, Script::Generations(vec![vec![ConstantTrue]]), 0);
    model.last_mut().unit.context = None;
    let oracle = ScriptedOracle::default();
    let report = run_all(&model, &oracle, &config(2));

    assert_eq!(report.total_patches, 1);
    assert_eq!(report.passes[0].skipped_units, 1);
    assert_eq!(model.units[1].representation_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn cancelled_monitor_stops_before_the_first_pass() {
    let model = ScriptedModel::with_units(3, Script::Endless, 0);
    let oracle = ScriptedOracle::default();
    let monitor = LoggingMonitor::new();
    monitor.cancel();
    let report = patch_all(&model, &oracle, &config(2), &monitor).unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert!(report.passes.is_empty());
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    assert!(monitor.is_finished());
}

/// Hands out a larger thread count every time it is read.
#[derive(Default)]
struct GrowingSettings {
    reads: AtomicUsize,
}

impl SettingsProvider for GrowingSettings {
    fn solver_config(&self) -> SolverConfig {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        config(1 + 2 * n)
    }
}

#[test]
fn thread_count_is_reread_every_global_pass() {
    let model = ScriptedModel::with_units(10, Script::Generations(vec![vec![ConstantTrue]]), 0);
    let oracle = ScriptedOracle::default();
    let settings = GrowingSettings::default();
    let report = patch_all(&model, &oracle, &settings, &LoggingMonitor::new()).unwrap();

    assert_eq!(
        report.passes.iter().map(|p| p.threads).collect::<Vec<_>>(),
        vec![1, 3]
    );
}

/// Raises the thread count in a shared store the first time progress is reported.
struct StoreBumpingMonitor<'a> {
    store: &'a GlobalSettings,
    inner: LoggingMonitor,
}

impl TaskMonitor for StoreBumpingMonitor<'_> {
    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    fn report_progress(&self, text: &str) {
        self.store.modify(|c| c.worker_threads = 4);
        self.inner.report_progress(text);
    }

    fn finish(&self) {
        self.inner.finish();
    }
}

#[test]
fn settings_store_updates_reach_a_running_solve() {
    let model = ScriptedModel::with_units(10, Script::Generations(vec![vec![ConstantTrue]]), 0);
    let oracle = ScriptedOracle::default();
    let store = GlobalSettings::new(config(1));
    let monitor = StoreBumpingMonitor {
        store: &store,
        inner: LoggingMonitor::new(),
    };
    let report = patch_all(&model, &oracle, &&store, &monitor).unwrap();

    assert_eq!(
        report.passes.iter().map(|p| p.threads).collect::<Vec<_>>(),
        vec![1, 4]
    );
}

const OPAQUE: &str = "
function 0x1000 opaque x86_64
  0x1000 k = 7
  0x1004 y = 0
  0x1008 if k == 7 goto 0x1010
  0x100c y = input
  0x1010 if y != 0 goto 0x1020
  0x1014 a = input
  0x1018 ret
  0x1020 a = 1
  0x1024 ret
end

function 0x2000 untouched x86_64
  0x2000 b = input
  0x2004 if b < 4 goto 0x200c
  0x2008 b = 4
  0x200c ret
end

function 0x3000 no_arch -
  0x3000 c = 0
  0x3004 if c goto 0x3000
  0x3008 ret
end

function 0x4000 imported x86_64
end
";

#[test]
fn listing_needs_reanalysis_between_patches() {
    let model = SharedListing::new(lift_from(OPAQUE).unwrap());
    let oracle = ConstEvaluator::new();
    let report = patch_all(&model, &oracle, &config(2), &LoggingMonitor::new()).unwrap();

    assert_eq!(report.state, RunState::Converged);
    assert_eq!(report.total_patches, 2);
    assert_eq!(report.passes[0].skipped_units, 2);

    let listing = model.snapshot();
    assert_eq!(
        listing.instruction_at(0x1008).unwrap().op,
        Op::Branch { target: 0x1010 }
    );
    assert_eq!(listing.instruction_at(0x1010).unwrap().op, Op::Nop);
    assert!(matches!(
        listing.instruction_at(0x2004).unwrap().op,
        Op::CondBranch { .. }
    ));
    assert!(matches!(
        listing.instruction_at(0x3004).unwrap().op,
        Op::CondBranch { .. }
    ));
    assert_eq!(
        model.stats.always_branch_patches.load(Ordering::SeqCst),
        1
    );
    assert_eq!(model.stats.never_branch_patches.load(Ordering::SeqCst), 1);
    assert!(listing.to_string().contains("0x100c y = input ; dead"));
}

#[test]
fn converged_listing_stays_converged() {
    let model = SharedListing::new(lift_from(OPAQUE).unwrap());
    let oracle = ConstEvaluator::new();
    let first = patch_all(&model, &oracle, &config(4), &LoggingMonitor::new()).unwrap();
    assert_eq!(first.state, RunState::Converged);

    let before = model.snapshot().to_string();
    let second = patch_all(&model, &oracle, &config(4), &LoggingMonitor::new()).unwrap();
    assert_eq!(second.state, RunState::Converged);
    assert_eq!(second.total_patches, 0);
    assert_eq!(second.passes.len(), 1);
    assert_eq!(model.snapshot().to_string(), before);
}

#[test]
fn current_unit_is_patched_to_its_fixpoint() {
    let model = SharedListing::new(lift_from(OPAQUE).unwrap());
    let oracle = ConstEvaluator::new();
    let monitor = LoggingMonitor::new();
    let report = patch_current_unit(&model, &oracle, &config(1), &monitor, 0x1014).unwrap();

    assert_eq!(report.unit.as_ref().map(|u| u.display_name()), Some("opaque".to_string()));
    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.patches, 2);
    assert_eq!(outcome.pass_results, vec![1, 1]);
    assert_eq!(outcome.status, UnitStatus::Converged);
    assert!(monitor.is_finished());
    // Only the requested function changed
    assert_eq!(model.patches_applied(), 2);
}

#[test]
fn current_unit_outside_any_function() {
    let model = SharedListing::new(lift_from(OPAQUE).unwrap());
    let oracle = ConstEvaluator::new();
    let monitor = LoggingMonitor::new();
    let report = patch_current_unit(&model, &oracle, &config(1), &monitor, 0x9999).unwrap();

    assert_eq!(report.unit, None);
    assert_eq!(report.patches(), 0);
    assert!(monitor.is_finished());
}

#[test]
fn current_unit_with_cancelled_monitor_patches_nothing() {
    let model = SharedListing::new(lift_from(OPAQUE).unwrap());
    let oracle = ConstEvaluator::new();
    let monitor = LoggingMonitor::new();
    monitor.cancel();
    let report = patch_current_unit(&model, &oracle, &config(1), &monitor, 0x1000).unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, UnitStatus::Cancelled);
    assert_eq!(outcome.passes, 0);
    assert_eq!(model.patches_applied(), 0);
    assert!(monitor.is_finished());
}

#[test]
fn current_unit_without_architecture_is_skipped() {
    let model = SharedListing::new(lift_from(OPAQUE).unwrap());
    let oracle = ConstEvaluator::new();
    let report =
        patch_current_unit(&model, &oracle, &config(1), &LoggingMonitor::new(), 0x3004).unwrap();

    assert_eq!(
        report.outcome.map(|o| o.status),
        Some(UnitStatus::Skipped(SkipReason::NoContext))
    );
    assert_eq!(model.patches_applied(), 0);
}

#[test]
fn spawned_runs_can_be_joined() {
    let model = Arc::new(SharedListing::new(lift_from(OPAQUE).unwrap()));
    let oracle = Arc::new(ConstEvaluator::new());
    let settings = Arc::new(config(2));
    let monitor = Arc::new(LoggingMonitor::new());

    let handle = crate::solver::spawn_patch_current_unit(
        model.clone(),
        oracle.clone(),
        settings.clone(),
        monitor.clone(),
        0x2000,
    )
    .unwrap();
    let unit_report = crate::solver::join(handle).unwrap();
    assert_eq!(unit_report.patches(), 0);

    let handle =
        crate::solver::spawn_patch_all(model.clone(), oracle, settings, monitor.clone()).unwrap();
    let report = crate::solver::join(handle).unwrap();
    assert_eq!(report.state, RunState::Converged);
    assert_eq!(report.total_patches, 2);
    assert!(monitor.is_finished());
    assert!(!monitor.is_cancelled());
}

#[test]
fn progress_is_reported_per_pass() {
    let model = ScriptedModel::with_units(40, Script::Generations(vec![vec![ConstantTrue]]), 0);
    let oracle = ScriptedOracle::default();
    let monitor = LoggingMonitor::new();
    patch_all(&model, &oracle, &config(2), &monitor).unwrap();

    assert_eq!(monitor.last_progress(), "Pass 2: 40/40 functions (100%)");
    let generations: BTreeMap<u64, usize> = model
        .units
        .iter()
        .map(|u| (u.unit.start, u.generation.load(Ordering::SeqCst)))
        .collect();
    assert_eq!(generations.len(), 40);
    assert!(generations.values().all(|&g| g == 1));
}
