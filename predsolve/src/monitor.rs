//! A [`TaskMonitor`] that reports progress through the logger.

use crate::host::TaskMonitor;
use crate::log::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Logs each distinct progress line, and can be cancelled from any thread.
#[derive(Default, Debug)]
pub struct LoggingMonitor {
    cancelled: AtomicBool,
    finished: AtomicBool,
    updates: AtomicUsize,
    last_progress: Mutex<String>,
}

impl LoggingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running task to stop. It does so at its next cancellation check.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            info!("Cancellation requested");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// The most recently reported progress text.
    pub fn last_progress(&self) -> String {
        match self.last_progress.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of progress reports that changed the text.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Acquire)
    }
}

impl TaskMonitor for LoggingMonitor {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn report_progress(&self, text: &str) {
        let mut last = match self.last_progress.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *last != text {
            debug!("{}", text);
            self.updates.fetch_add(1, Ordering::AcqRel);
            *last = text.to_owned();
        }
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            trace!("Monitor finished twice");
        }
    }
}
