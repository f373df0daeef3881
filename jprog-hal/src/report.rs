//! Progress and log callbacks plus the cooperative cancellation token.
//!
//! Long-running operations (SVF playback, bitstream loading) take a
//! [`Reporter`] for user-facing milestones and a [`CancelToken`] that they
//! poll between commands or steps. Wire-level diagnostics go through the
//! `log` facade instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Severity of a user-facing log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

type ProgressFn = dyn FnMut(u8) + Send;
type LogFn = dyn FnMut(LogLevel, &str) + Send;

/// Collects the observer callbacks for one programming session.
///
/// Progress is clamped monotone: a stage reporting a lower percentage than
/// an earlier one is not propagated backwards.
#[derive(Default)]
pub struct Reporter {
    progress: Option<Box<ProgressFn>>,
    log: Option<Box<LogFn>>,
    percent: u8,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl FnMut(u8) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_log(mut self, f: impl FnMut(LogLevel, &str) + Send + 'static) -> Self {
        self.log = Some(Box::new(f));
        self
    }

    pub fn progress(&mut self, percent: u8) {
        let percent = percent.min(100).max(self.percent);
        if percent != self.percent {
            self.percent = percent;
            if let Some(f) = &mut self.progress {
                f(percent);
            }
        }
    }

    /// Reset the monotone clamp, for reuse across operations.
    pub fn restart(&mut self) {
        self.percent = 0;
        if let Some(f) = &mut self.progress {
            f(0);
        }
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        if let Some(f) = &mut self.log {
            f(level, message);
        }
    }

    pub fn info(&mut self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&mut self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn success(&mut self, message: &str) {
        self.log(LogLevel::Success, message);
    }
}

/// Shared flag observed between commands and steps of a long operation.
///
/// Cancellation is cooperative: a transfer already on the wire completes,
/// and the driver recovers the TAP with a reset before returning
/// [`Error::Cancelled`].
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if the token has been triggered.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
