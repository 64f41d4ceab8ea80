use predsolve::*;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

/// Remove opaque predicates from programs by patching constant branches
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Patch every function until no constant branch is left
    PatchAll {
        /// Path to a textual listing
        listing: PathBuf,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Patch the function containing an address
    PatchFunction {
        /// Path to a textual listing
        listing: PathBuf,
        /// Any address inside the function, in hex
        #[clap(long, parse(try_from_str = parse_hex))]
        address: u64,
        #[clap(flatten)]
        common: CommonArgs,
    },
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// Number of worker threads for each pass over the program
    #[clap(long)]
    threads: Option<usize>,
    /// Maximum scan-then-patch cycles for a single function
    #[clap(long)]
    max_passes_per_function: Option<usize>,
    /// Maximum passes over the whole program
    #[clap(long)]
    max_global_passes: Option<usize>,
    /// Path to write the patched listing to (default: stdout)
    #[clap(long)]
    output: Option<PathBuf>,
    /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
    /// use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being spewed the logger,
    /// by default, does not block, but instead dumps a dropped-messages alert. This option
    /// forces it to block and dump even if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at stderr (in addition
    /// to being added to the log)
    #[clap(long = "log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
    /// Advanced configuration options to tweak the patching behavior
    #[clap(short = 'Z', long, arg_enum)]
    advanced_config: Vec<solver_config::CommandLineSolverConfig>,
}

fn parse_hex(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

impl CommonArgs {
    fn solver_config(&self) -> solver_config::SolverConfig {
        let mut config = solver_config::SolverConfig::from(self.advanced_config.clone());
        if let Some(t) = self.threads {
            config.worker_threads = t;
        }
        if let Some(p) = self.max_passes_per_function {
            config.max_passes_per_unit = p;
        }
        if let Some(p) = self.max_global_passes {
            config.max_global_passes = p;
        }
        config
    }
}

fn main() {
    let args = Args::parse();
    let (listing_path, address, common) = match args {
        Args::PatchAll { listing, common } => (listing, None, common),
        Args::PatchFunction {
            listing,
            address,
            common,
        } => (listing, Some(address), common),
    };

    let logger = match log::FileAndTermDrain::new(
        common.debug,
        common.debug_disable_terminal_logging,
        common.debug_forced_blocking_terminal_logging,
        common.log_file.clone(),
    ) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Could not set up logging: {}", e);
            std::process::exit(1);
        }
    };
    let _log_guard = slog_scope::set_global_logger(logger);

    if let Err(e) = run(listing_path, address, &common) {
        log::crit!("{}", e);
        std::process::exit(1);
    }
    log::trace!("Done");
}

fn run(listing_path: PathBuf, address: Option<u64>, common: &CommonArgs) -> Result<()> {
    solver_config::SETTINGS.update(common.solver_config());

    let listing = lifter::lift_from(&std::fs::read_to_string(listing_path)?)?;
    let model = Arc::new(listing::SharedListing::new(listing));
    let oracle = Arc::new(const_eval::ConstEvaluator::new());
    let monitor = Arc::new(monitor::LoggingMonitor::new());
    // The live store, so updates made during the run apply from the next global pass.
    let settings = Arc::new(&*solver_config::SETTINGS);

    match address {
        None => {
            let handle = solver::spawn_patch_all(
                model.clone(),
                oracle,
                settings,
                monitor.clone(),
            )?;
            let report = solver::join(handle)?;
            eprintln!("{}", report);
        }
        Some(address) => {
            let handle = solver::spawn_patch_current_unit(
                model.clone(),
                oracle,
                settings,
                monitor.clone(),
                address,
            )?;
            let report = solver::join(handle)?;
            match &report.unit {
                Some(unit) => eprintln!(
                    "{} patches applied to {} in {:.3}s",
                    report.patches(),
                    unit.display_name(),
                    report.elapsed.as_secs_f64()
                ),
                None => eprintln!("No function at {:#x}", address),
            }
        }
    }
    log::debug!("Monitor finished"; "finished" => monitor.is_finished());

    let patched = model.snapshot();
    if let Some(path) = &common.output {
        use std::io::Write;
        write!(std::fs::File::create(path)?, "{}", patched)?;
    } else {
        print!("{}", patched);
    }
    Ok(())
}
