//! takeout-rebuild - Command-line interface for the Takeout rebuild engine.
//!
//! Rebuilds a Drive folder tree from extracted Takeout exports, verifies a
//! previous run against its manifest, or rolls a run back.

mod logging;

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::unbounded;
use engine::{
    remover_for, rollback, spawn_run, verify, ChannelReporter, ChecksumAlgorithm,
    DuplicatePolicy, Manifest, ProgressEvent, RemovalStrategy, RollbackOptions,
    RollbackOutcome, RunConfig, RunContext, RunResult, RunState,
};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code for usage, configuration and fatal run errors
const EXIT_FATAL: i32 = 2;

/// Number of per-entry errors listed in the summary
const ERROR_LISTING_LIMIT: usize = 20;

/// takeout-rebuild - Rebuild a Google Drive tree from Takeout exports
#[derive(Parser, Debug)]
#[command(name = "takeout-rebuild")]
#[command(version)]
#[command(about = "Rebuild a Google Drive folder tree from extracted Takeout exports")]
struct Cli {
    /// Enable debug logging and per-entry output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy the export contents into a rebuilt folder tree
    Rebuild(RebuildArgs),

    /// Re-hash the files a run copied and compare them to its manifest
    Verify {
        /// Manifest written by a previous run
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },

    /// Remove the files a run copied (preview unless --execute)
    Rollback(RollbackArgs),
}

#[derive(Args, Debug, Default)]
struct RebuildArgs {
    /// Extracted export root; repeat in Takeout part order
    #[arg(long = "src", value_name = "PATH")]
    sources: Vec<PathBuf>,

    /// Destination root of the rebuilt tree
    #[arg(long, value_name = "PATH")]
    dst: Option<PathBuf>,

    /// TOML run configuration; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Record what would happen without writing any file
    #[arg(long)]
    dry_run: bool,

    /// Verify copied files once copying finishes
    #[arg(long)]
    verify: bool,

    /// Duplicate policy: dedupe, keep-all or rename-duplicates
    #[arg(long, value_name = "POLICY")]
    policy: Option<String>,

    /// Hash algorithm: sha256, blake3 or md5
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Extra attempts after a failed copy
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Entries between two progress updates
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Hashing threads
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Directory for the manifest and log file
    #[arg(long, value_name = "DIR")]
    manifest_dir: Option<PathBuf>,

    /// Copy Takeout's JSON metadata sidecars as ordinary files
    #[arg(long)]
    keep_sidecars: bool,
}

#[derive(Args, Debug)]
struct RollbackArgs {
    /// Manifest written by a previous run
    #[arg(value_name = "MANIFEST")]
    manifest: PathBuf,

    /// Actually remove files; without it only a preview is printed
    #[arg(long)]
    execute: bool,

    /// Delete permanently instead of moving to the trash
    #[arg(long)]
    plain_delete: bool,

    /// Remove files even if they changed since the run
    #[arg(long)]
    force: bool,
}

/// Combine the optional config file with command-line overrides.
fn build_config(args: &RebuildArgs) -> Result<RunConfig, String> {
    let mut config = match (&args.config, &args.dst) {
        (Some(path), _) => RunConfig::load(path).map_err(|e| e.to_string())?,
        (None, Some(dst)) => RunConfig::new(Vec::new(), dst.clone()),
        (None, None) => return Err("Either --dst or --config is required".to_string()),
    };

    if !args.sources.is_empty() {
        config.source_roots = args.sources.clone();
    }
    if let Some(dst) = &args.dst {
        config.destination_root = dst.clone();
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if args.verify {
        config.verify = true;
    }
    if args.keep_sidecars {
        config.skip_metadata_sidecars = false;
    }

    if let Some(policy) = &args.policy {
        config.duplicate_policy = DuplicatePolicy::from_str(policy).ok_or_else(|| {
            format!(
                "Invalid duplicate policy '{}'. Must be 'dedupe', 'keep-all', or 'rename-duplicates'",
                policy
            )
        })?;
    }
    if let Some(hash) = &args.hash {
        config.hash_algorithm = ChecksumAlgorithm::from_str(hash).ok_or_else(|| {
            format!(
                "Invalid hash algorithm '{}'. Must be 'sha256', 'blake3', or 'md5'",
                hash
            )
        })?;
    }
    if let Some(retries) = args.retries {
        config.retry_count = retries;
    }
    if let Some(batch_size) = args.batch_size {
        config.progress_batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.hash_workers = workers;
    }
    if let Some(dir) = &args.manifest_dir {
        config.manifest_dir = Some(dir.clone());
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Renders progress events as they arrive from the worker thread.
struct CliProgress {
    verbose: bool,
    last_state: Cell<Option<RunState>>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            last_state: Cell::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn on_event(&self, event: &ProgressEvent) {
        if self.last_state.get() != Some(event.state) {
            if self.last_state.get() == Some(RunState::Copying) {
                eprintln!();
            }
            eprintln!("==> {}", event.state);
            self.last_state.set(Some(event.state));
        }

        if event.state != RunState::Copying {
            return;
        }

        if self.verbose {
            if let Some(entry) = &event.last_entry {
                let target = entry
                    .destination
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                eprintln!(
                    "  {:<18} {} -> {}",
                    entry.outcome.to_string(),
                    entry.source.display(),
                    target
                );
            }
            return;
        }

        let stats = &event.statistics;
        let processed = stats.files_copied
            + stats.duplicates_skipped
            + stats.dry_run_planned
            + stats.metadata_skipped
            + stats.errors;
        eprint!(
            "\rProgress: {}/{} | copied {} | duplicates {} | errors {} | {}",
            processed,
            stats.files_scanned + stats.metadata_skipped,
            stats.files_copied,
            stats.duplicates_skipped,
            stats.errors,
            Self::format_bytes(stats.bytes_transferred)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn print_summary(&self, result: &RunResult) {
        let stats = &result.statistics;
        eprintln!();
        eprintln!("Run {}", result.final_state);
        eprintln!(
            "Summary: {} scanned, {} copied, {} duplicates skipped, {} planned, {} failed",
            stats.files_scanned,
            stats.files_copied,
            stats.duplicates_skipped,
            stats.dry_run_planned,
            stats.errors
        );
        if stats.metadata_skipped > 0 {
            eprintln!("Metadata sidecars skipped: {}", stats.metadata_skipped);
        }
        eprintln!("Bytes copied: {}", Self::format_bytes(stats.bytes_transferred));
        eprintln!("Elapsed: {}", Self::format_duration(stats.elapsed));

        if let Some(path) = &result.manifest_location {
            eprintln!("Manifest: {}", path.display());
        }
        if let Some(fatal) = &result.fatal {
            eprintln!("Error: {}", fatal);
        }

        if !result.errors.is_empty() {
            eprintln!();
            eprintln!("Failed entries:");
            for error in result.errors.iter().take(ERROR_LISTING_LIMIT) {
                eprintln!(
                    "  [{}] {}: {}",
                    error.error_kind,
                    error.source.display(),
                    error.detail
                );
            }
            if result.errors.len() > ERROR_LISTING_LIMIT {
                eprintln!("  ... and {} more", result.errors.len() - ERROR_LISTING_LIMIT);
            }
        }

        if let Some(report) = &result.verification {
            eprintln!();
            eprint!("{}", report.render());
        }
    }
}

fn run_rebuild(config: RunConfig, verbose: bool) -> Result<i32, String> {
    let (tx, rx) = unbounded::<ProgressEvent>();
    let ctx = RunContext::new();
    let handle = spawn_run(&ctx, config, Some(Box::new(ChannelReporter::new(tx))))
        .map_err(|e| format!("Failed to start run: {}", e))?;

    let progress = CliProgress::new(verbose);
    // The channel closes when the worker drops its reporter at the end of the run.
    for event in rx.iter() {
        progress.on_event(&event);
    }

    let result = handle.join().map_err(|e| e.to_string())?;
    progress.print_summary(&result);
    Ok(result.exit_code())
}

fn run_verify(manifest_path: &Path) -> Result<i32, String> {
    let manifest = Manifest::load(manifest_path).map_err(|e| e.to_string())?;
    let report = verify(&manifest);
    print!("{}", report.render());
    Ok(if report.passed() { 0 } else { 1 })
}

fn run_rollback(args: &RollbackArgs) -> Result<i32, String> {
    let manifest = Manifest::load(&args.manifest).map_err(|e| e.to_string())?;
    let strategy = if args.plain_delete {
        RemovalStrategy::Plain
    } else {
        RemovalStrategy::Trash
    };
    let remover = remover_for(strategy);
    let options = RollbackOptions {
        execute: args.execute,
        force: args.force,
    };

    let report = rollback(&manifest, remover.as_ref(), options).map_err(|e| e.to_string())?;

    for item in &report.items {
        let target = item
            .destination
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| item.source.display().to_string());
        println!("{:<18} {}", item.outcome.to_string(), target);
    }
    println!();
    if args.execute {
        println!(
            "Rollback: {} removed, {} already absent, {} modified (kept), {} failed",
            report.count(&RollbackOutcome::Removed),
            report.count(&RollbackOutcome::AlreadyAbsent),
            report.count(&RollbackOutcome::SkippedModified),
            report.failed()
        );
    } else {
        println!(
            "Preview: {} would be removed, {} already absent, {} modified (kept). Re-run with --execute to apply.",
            report.count(&RollbackOutcome::WouldRemove),
            report.count(&RollbackOutcome::AlreadyAbsent),
            report.count(&RollbackOutcome::SkippedModified)
        );
    }

    Ok(if report.is_success() { 0 } else { 1 })
}

/// Directory the log file goes to for a given command.
fn log_dir_for(command: &Command, config: Option<&RunConfig>) -> Option<PathBuf> {
    match command {
        Command::Rebuild(_) => config.map(RunConfig::manifest_dir),
        Command::Verify { manifest } => manifest.parent().map(Path::to_path_buf),
        Command::Rollback(args) => args.manifest.parent().map(Path::to_path_buf),
    }
}

/// Main CLI logic - separated for testability
///
/// `config` is the rebuild configuration `main` already built for logging
/// setup; it is built from the arguments when absent.
fn run_cli(cli: &Cli, config: Option<RunConfig>) -> Result<i32, String> {
    match &cli.command {
        Command::Rebuild(args) => {
            let config = match config {
                Some(config) => config,
                None => build_config(args)?,
            };
            run_rebuild(config, cli.verbose)
        }
        Command::Verify { manifest } => run_verify(manifest),
        Command::Rollback(args) => run_rollback(args),
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match &cli.command {
        Command::Rebuild(args) => match build_config(args) {
            Ok(config) => Some(config),
            Err(msg) => {
                eprintln!("Error: {}", msg);
                std::process::exit(EXIT_FATAL);
            }
        },
        _ => None,
    };
    let log_dir = log_dir_for(&cli.command, config.as_ref());
    let _guard = logging::init_logging(cli.verbose, log_dir.as_deref());

    let exit_code = match run_cli(&cli, config) {
        Ok(code) => code,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            EXIT_FATAL
        }
    };

    drop(_guard);
    std::process::exit(exit_code);
}
