//! Errors that can surface from the patch engine and the bundled listing host.

use thiserror::Error;

/// Build a [`Error::Malformed`] for a listing line, with an optional format string.
macro_rules! malformed_error {
    ($line:expr, $msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            line: $line,
        }
    };

    ($line:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            line: $line,
        }
    };
}

pub(crate) use malformed_error;

/// The generic Error type, covering everything this library can return.
///
/// Skip conditions (missing representation, missing architecture, empty function), unresolved
/// conditions, and refused availability guards are _not_ errors; they are logged and the engine
/// moves on. Only failures that prevent a unit or a run from making progress end up here.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error while reading a listing or writing output.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The listing text could not be lifted.
    ///
    /// `line` is 1-based; `0` refers to the listing as a whole.
    #[error("Malformed listing - line {line}: {message}")]
    Malformed {
        /// What was wrong
        message: String,
        /// The offending line
        line: usize,
    },

    /// The program model refused to apply a patch that its availability guard had accepted.
    #[error("Patch at {address:#x} rejected: {message}")]
    PatchRejected {
        /// Address of the branch instruction
        address: u64,
        /// Reason given by the model
        message: String,
    },

    /// A worker or orchestrator thread could not be started.
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(std::io::Error),

    /// A worker thread panicked; the pool was still joined completely.
    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
