//! Configuration knobs for the patch engine, and the process-wide store they are read from.
//!
//! The store can be updated while a run is in flight; the orchestrator re-reads it at the start
//! of every global pass, so a new worker thread count applies from the next pass on.

use std::sync::RwLock;

/// Limits and sizing for a patching run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolverConfig {
    /// Maximum number of scan-then-apply cycles for a single function before giving up on it
    /// with a warning.
    pub max_passes_per_unit: usize,
    /// Maximum number of passes over the whole program before giving up with a warning.
    pub max_global_passes: usize,
    /// Number of worker threads spawned for each global pass. Values below 1 are treated as 1.
    pub worker_threads: usize,
    /// Log every patch as it is applied, rather than only per-function totals.
    pub log_individual_patches: bool,
    /// Log branch sites whose availability guard refused a patch.
    pub log_refused_patches: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_passes_per_unit: 10,
            max_global_passes: 20,
            worker_threads: 8,
            log_individual_patches: false,
            log_refused_patches: false,
        }
    }
}

impl SolverConfig {
    /// The worker thread count, clamped to at least one.
    pub fn effective_worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }
}

/// Source of the current configuration. Hosts backed by a settings store implement this; a plain
/// [`SolverConfig`] is a fixed source.
pub trait SettingsProvider: Sync {
    /// Read the configuration as it is right now.
    fn solver_config(&self) -> SolverConfig;
}

impl<T: SettingsProvider + ?Sized> SettingsProvider for &T {
    fn solver_config(&self) -> SolverConfig {
        (**self).solver_config()
    }
}

impl SettingsProvider for SolverConfig {
    fn solver_config(&self) -> SolverConfig {
        self.clone()
    }
}

/// The process-wide settings store, accessed through [`static@SETTINGS`].
pub struct GlobalSettings {
    config: RwLock<SolverConfig>,
}

impl GlobalSettings {
    /// A store holding `config`.
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace the stored configuration. Runs in flight pick it up at their next global pass.
    pub fn update(&self, config: SolverConfig) {
        // A poisoned store still holds a complete config; overwrite it regardless.
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Apply `f` to the stored configuration in place.
    pub fn modify(&self, f: impl FnOnce(&mut SolverConfig)) {
        let mut config = self.solver_config();
        f(&mut config);
        self.update(config);
    }
}

impl SettingsProvider for GlobalSettings {
    fn solver_config(&self) -> SolverConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

lazy_static::lazy_static! {
    /// The global settings store
    pub static ref SETTINGS: GlobalSettings = GlobalSettings::new(SolverConfig::default());
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Advanced configuration toggles
pub enum CommandLineSolverConfig {
    LogIndividualPatches,
    LogRefusedPatches,
    SingleThreaded,
}

impl SolverConfig {
    /// Layer command-line toggles on top of `self`.
    pub fn with_command_line(mut self, toggles: Vec<CommandLineSolverConfig>) -> Self {
        use CommandLineSolverConfig::*;
        for t in toggles {
            match t {
                LogIndividualPatches => {
                    self.log_individual_patches = true;
                }
                LogRefusedPatches => {
                    self.log_refused_patches = true;
                }
                SingleThreaded => {
                    self.worker_threads = 1;
                }
            }
        }
        self
    }
}

impl From<Vec<CommandLineSolverConfig>> for SolverConfig {
    fn from(v: Vec<CommandLineSolverConfig>) -> Self {
        SolverConfig::default().with_command_line(v)
    }
}
