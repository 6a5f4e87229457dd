use std::fs;
use std::path::Path;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter, e.g. `TAKEOUT_LOG=engine=debug`.
pub const LOG_ENV: &str = "TAKEOUT_LOG";

pub const LOG_FILE_NAME: &str = "takeout-rebuild.log";

/// Install the global subscriber: stderr, plus a log file in `log_dir` when
/// that directory can be created.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// until the program exits.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (file_layer, guard) = match log_dir.filter(|dir| fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        if let Some(dir) = log_dir {
            debug!(log_dir = %dir.display(), "logging to file");
        }
    }
    guard
}
