//! Rollback of a finalized manifest.
//!
//! Every `copied` entry is undone in reverse manifest order. Files are removed
//! through a [`Remover`], so the caller picks between the system trash and a
//! plain unlink. Re-running a rollback is harmless: files that are already gone
//! are reported as such.

use crate::checksums::compute_file_checksum;
use crate::config::RemovalStrategy;
use crate::error::EngineError;
use crate::manifest::{Manifest, ManifestEntry};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Capability to dispose of one file.
pub trait Remover {
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Short label for logs
    fn name(&self) -> &'static str;
}

/// Moves files to the system trash / recycle bin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrashRemover;

impl Remover for TrashRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        trash::delete(path).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn name(&self) -> &'static str {
        "trash"
    }
}

/// Unlinks files. Nothing can be recovered afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRemover;

impl Remover for PlainRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

pub fn remover_for(strategy: RemovalStrategy) -> Box<dyn Remover> {
    match strategy {
        RemovalStrategy::Trash => Box::new(TrashRemover),
        RemovalStrategy::Plain => Box::new(PlainRemover),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackOptions {
    /// Without this only a preview is produced
    pub execute: bool,
    /// Remove files even when their content changed since the run
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Removed,
    AlreadyAbsent,
    /// Preview: the file would be removed
    WouldRemove,
    /// Content differs from the recorded hash; left in place
    SkippedModified,
    Failed(String),
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::Removed => write!(f, "removed"),
            RollbackOutcome::AlreadyAbsent => write!(f, "already-absent"),
            RollbackOutcome::WouldRemove => write!(f, "would-remove"),
            RollbackOutcome::SkippedModified => write!(f, "skipped-modified"),
            RollbackOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackItem {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub outcome: RollbackOutcome,
}

/// Per-entry rollback outcomes, in the order they were processed.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub items: Vec<RollbackItem>,
    /// Directories removed because they became empty
    pub pruned_dirs: Vec<PathBuf>,
}

impl RollbackReport {
    pub fn count(&self, outcome: &RollbackOutcome) -> usize {
        self.items.iter().filter(|i| &i.outcome == outcome).count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, RollbackOutcome::Failed(_)))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Undo the `copied` entries of a finalized manifest, newest first.
///
/// # Errors
/// `ManifestNotFinalized` when the manifest has no trailer. Per-file problems
/// are reported in the returned report.
pub fn rollback(
    manifest: &Manifest,
    remover: &dyn Remover,
    options: RollbackOptions,
) -> Result<RollbackReport, EngineError> {
    if !manifest.is_finalized() {
        return Err(EngineError::ManifestNotFinalized {
            path: manifest.path.clone(),
        });
    }

    info!(
        manifest = %manifest.path.display(),
        remover = remover.name(),
        execute = options.execute,
        "starting rollback"
    );

    let root = manifest.destination_root();
    let mut report = RollbackReport::default();

    for entry in manifest.copied().rev() {
        let outcome = roll_back_entry(entry, remover, options);
        if outcome == RollbackOutcome::Removed {
            if let (Some(destination), Some(root)) = (&entry.destination, root) {
                prune_empty_parents(destination, root, &mut report.pruned_dirs);
            }
        }
        report.items.push(RollbackItem {
            source: entry.source.clone(),
            destination: entry.destination.clone(),
            outcome,
        });
    }

    info!(
        removed = report.count(&RollbackOutcome::Removed),
        absent = report.count(&RollbackOutcome::AlreadyAbsent),
        modified = report.count(&RollbackOutcome::SkippedModified),
        failed = report.failed(),
        "rollback finished"
    );
    Ok(report)
}

fn roll_back_entry(
    entry: &ManifestEntry,
    remover: &dyn Remover,
    options: RollbackOptions,
) -> RollbackOutcome {
    let destination = match &entry.destination {
        Some(destination) => destination,
        None => return RollbackOutcome::Failed("no destination recorded".to_string()),
    };

    match fs::symlink_metadata(destination) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return RollbackOutcome::Failed("destination is not a regular file".to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(destination = %destination.display(), "already absent");
            return RollbackOutcome::AlreadyAbsent;
        }
        Err(e) => return RollbackOutcome::Failed(e.to_string()),
    }

    if !options.force {
        if let Some(expected) = &entry.hash {
            match compute_file_checksum(destination, expected.algorithm(), None) {
                Ok(actual) if &actual == expected => {}
                Ok(_) => {
                    warn!(
                        destination = %destination.display(),
                        "file changed since the run, leaving it in place"
                    );
                    return RollbackOutcome::SkippedModified;
                }
                Err(e) => return RollbackOutcome::Failed(e.to_string()),
            }
        }
    }

    if !options.execute {
        return RollbackOutcome::WouldRemove;
    }

    match remover.remove(destination) {
        Ok(()) => {
            debug!(destination = %destination.display(), "removed");
            RollbackOutcome::Removed
        }
        Err(e) => {
            warn!(destination = %destination.display(), error = %e, "failed to remove");
            RollbackOutcome::Failed(e.to_string())
        }
    }
}

/// Remove now-empty directories between `path` and `root`, never `root` itself.
fn prune_empty_parents(path: &Path, root: &Path, pruned: &mut Vec<PathBuf>) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        pruned.push(dir.to_path_buf());
        current = dir.parent();
    }
}
