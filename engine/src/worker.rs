//! Running a reconstruction on a background thread.
//!
//! The caller keeps its own thread free and follows the run through progress
//! events, typically a [`ChannelReporter`](crate::progress::ChannelReporter)
//! whose receiver it polls.

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::model::RunResult;
use crate::progress::ProgressReporter;
use crate::rebuild::run_acquired;
use std::thread::{self, JoinHandle};
use tracing::error;

/// Handle to a run executing on its worker thread.
pub struct RunHandle {
    ctx: RunContext,
    thread: JoinHandle<RunResult>,
}

impl RunHandle {
    /// Request cooperative cancellation; the run stops after its in-flight entry.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run to end.
    pub fn join(self) -> Result<RunResult, EngineError> {
        self.thread.join().map_err(|_| {
            error!("run worker thread panicked");
            EngineError::WorkerPanicked
        })
    }
}

/// Start a run on a dedicated thread.
///
/// The context's latch is taken before the thread starts, so a second run on
/// the same context is rejected here with `RunAlreadyActive`.
pub fn spawn_run(
    ctx: &RunContext,
    config: RunConfig,
    reporter: Option<Box<dyn ProgressReporter>>,
) -> Result<RunHandle, EngineError> {
    let latch = ctx.acquire()?;
    let thread_ctx = ctx.clone();

    let thread = thread::Builder::new()
        .name("takeout-run".to_string())
        .spawn(move || run_acquired(&thread_ctx, &config, reporter.as_deref(), latch))
        .map_err(|e| EngineError::WorkerPool {
            reason: e.to_string(),
        })?;

    Ok(RunHandle {
        ctx: ctx.clone(),
        thread,
    })
}
