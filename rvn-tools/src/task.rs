//! Context for long running work.
//!
//! Verification, cleanup and bulk checkouts run for a long time; callers
//! hand them a [`TaskContext`] so the work can be aborted between items
//! and so messages land in the caller's log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;

use crate::actor::Cancelled;

pub trait TaskContext {
    /// If the task should be aborted, this should fail with a reasonable
    /// error message.
    fn check_abort(&self) -> Result<(), Error>;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);
}

impl<T: TaskContext + ?Sized> TaskContext for Arc<T> {
    fn check_abort(&self) -> Result<(), Error> {
        <T as TaskContext>::check_abort(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as TaskContext>::log(self, level, message)
    }
}

impl<T: TaskContext + ?Sized> TaskContext for &T {
    fn check_abort(&self) -> Result<(), Error> {
        <T as TaskContext>::check_abort(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as TaskContext>::log(self, level, message)
    }
}

/// Log an informational message through a [`TaskContext`].
#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::TaskContext::log(&$task, log::Level::Info, &format_args!($($fmt)+))
    }};
}

/// Log a warning through a [`TaskContext`].
#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::TaskContext::log(&$task, log::Level::Warn, &format_args!($($fmt)+))
    }};
}

/// Context for foreground work: logs to the global logger, never aborts.
pub struct ForegroundTask;

impl TaskContext for ForegroundTask {
    fn check_abort(&self) -> Result<(), Error> {
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "{}", message);
    }
}

/// Context whose abort state is driven by an [`AbortHandle`].
pub struct AbortableTask {
    aborted: Arc<AtomicBool>,
}

/// Requests the abort of the matching [`AbortableTask`] from another
/// thread.
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

impl AbortableTask {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> AbortHandle {
        AbortHandle {
            aborted: Arc::clone(&self.aborted),
        }
    }
}

impl Default for AbortableTask {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext for AbortableTask {
    fn check_abort(&self) -> Result<(), Error> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "{}", message);
    }
}
