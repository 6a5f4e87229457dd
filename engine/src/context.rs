//! Caller-owned run context.
//!
//! A [`RunContext`] replaces process-wide state: it holds the active-run latch,
//! the cooperative cancellation flag and the clock used for manifest
//! timestamps. Clones share all three, so a control thread can keep one clone
//! to cancel a run executing on another thread.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of manifest and event timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant. Two runs over the same input with a fixed
/// clock write byte-identical manifests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        FixedClock(at)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Shared state for runs that must not overlap.
///
/// The one-active-run rule holds per context, not per process: two runs given
/// clones of the same context exclude each other, while runs given unrelated
/// contexts do not. A front end that wants a single run per process creates
/// one context at startup and hands clones of it to every caller, which is
/// what the CLI does. No hidden global is involved, so tests can run in
/// parallel with a context each.
#[derive(Clone)]
pub struct RunContext {
    active: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        RunContext {
            active: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Ask the active run to stop after its in-flight entry.
    ///
    /// A request made before a run starts applies to that run. The flag is
    /// cleared when the run ends.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// True while a run holds this context's latch.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Take the active-run latch, failing if another run holds it.
    pub(crate) fn acquire(&self) -> Result<ActiveRun, EngineError> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::RunAlreadyActive)?;
        Ok(ActiveRun {
            active: Arc::clone(&self.active),
            cancel: Arc::clone(&self.cancel),
        })
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("active", &self.is_active())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Holds the latch for one run; releasing it also clears pending cancellation.
pub(crate) struct ActiveRun {
    active: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }
}
