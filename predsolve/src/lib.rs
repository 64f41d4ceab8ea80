//! Concurrent fixed-point patching of opaque predicates.
//!
//! The engine walks every function of a program, asks a [`host::ConditionOracle`] whether each
//! conditional branch has a constant outcome, and rewrites constant branches into a no-op
//! (never-branch) or an unconditional jump (always-branch). Rewrites trigger re-analysis, which
//! can expose more constant branches, so both the per-function loop ([`convergence`]) and the
//! whole-program loop ([`orchestrator`]) run until nothing changes or a pass cap is hit.
//!
//! Program state lives with the host ([`host::ProgramModel`]). Scans run in parallel on worker
//! threads; every mutation funnels through the single [`gateway::MutationGate`].
//!
//! A small in-process host ([`listing`], [`lifter`], [`const_eval`], [`monitor`]) backs the
//! command-line tool and the tests.

pub mod cancellation;
pub mod const_eval;
pub mod convergence;
pub mod error;
pub mod gateway;
pub mod host;
pub mod lifter;
pub mod listing;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod solver;
pub mod solver_config;
pub mod worker_pool;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A key-value pair that is only emitted if the value is present.
    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            if let Some(v) = &self.1 {
                v.serialize(record, self.0, serializer)
            } else {
                Ok(())
            }
        }
    }

    /// Hex rendering for addresses in structured log fields.
    pub struct Addr(pub u64);
    impl slog::Value for Addr {
        fn serialize(
            &self,
            _record: &slog::Record,
            key: slog::Key,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            serializer.emit_arguments(key, &format_args!("{:#x}", self.0))
        }
    }

    /// Drain that fans records out to the terminal and, optionally, a JSON log file.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> crate::Result<slog::Logger> {
            use sloggers::Build;

            let debug_level = match debug_level {
                0 => sloggers::types::Severity::Warning,
                1 => sloggers::types::Severity::Info,
                2 => sloggers::types::Severity::Debug,
                _ => sloggers::types::Severity::Trace,
            };
            let build_failed = |e: sloggers::Error| {
                crate::Error::FileError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                ))
            };

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder
                    .build()
                    .map_err(build_failed)?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if path.is_none() {
                        debug_level
                    } else {
                        sloggers::types::Severity::Error
                    })
                    .overflow_strategy(if force_block || path.is_none() {
                        sloggers::types::OverflowStrategy::Block
                    } else {
                        sloggers::types::OverflowStrategy::DropAndReport
                    })
                    .format(sloggers::types::Format::Compact)
                    .build()
                    .map_err(build_failed)?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(debug_level)
                        .overflow_strategy(sloggers::types::OverflowStrategy::Block)
                        .format(sloggers::types::Format::Json)
                        .build()
                        .map_err(build_failed)?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
