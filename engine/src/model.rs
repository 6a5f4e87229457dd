//! Core data model for reconstruction runs.
//!
//! This module defines the values that flow through a run:
//! - SourceEntry: one file discovered under an export root
//! - ResolvedPath: where that file belongs in the rebuilt Drive tree
//! - Outcome, RunState, DuplicatePolicy: enums controlling and describing behavior
//! - RunStatistics and RunResult: what the caller reads back

use crate::error::{EngineError, EntryError};
use crate::verify::VerificationReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// A single file found under one of the run's export roots.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Absolute path on disk
    pub source_path: PathBuf,

    /// Path relative to its export root, exactly as extracted
    pub raw_relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Modification time reported by the filesystem
    pub modified: Option<SystemTime>,

    /// Index of the owning root in `RunConfig::source_roots`
    pub export_root: usize,
}

/// How the resolver treated a Takeout duplicate suffix such as `photo(1).jpg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixVerdict {
    /// No suffix, or a suffix with no matching base name among the siblings
    Absent,
    /// Suffix marks a distinct file; it was replaced by a counter name
    Genuine,
    /// Suffix was added by the export; the entry collapses onto the base name
    Artifact,
}

/// Output of the path resolver for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Drive-relative destination path
    pub logical_path: PathBuf,

    pub suffix: SuffixVerdict,
}

/// Outcome of one processed entry, as written to the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// File was written to its destination
    Copied,
    /// Content already present (another entry or a pre-existing file)
    SkippedDuplicate,
    /// Dry run: the copy was planned but not performed
    SkippedDryRun,
    /// Takeout JSON metadata sidecar, left out of the rebuilt tree
    SkippedMetadata,
    /// Resolution, hashing or copying failed
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Copied => write!(f, "copied"),
            Outcome::SkippedDuplicate => write!(f, "skipped-duplicate"),
            Outcome::SkippedDryRun => write!(f, "skipped-dry-run"),
            Outcome::SkippedMetadata => write!(f, "skipped-metadata"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

/// How content-identical files are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Copy only the canonical member of each duplicate group
    #[default]
    Dedupe,
    /// Copy every entry under its own collision-safe name
    KeepAll,
    /// Copy every entry, and mark non-canonical members in the manifest
    RenameDuplicates,
}

impl DuplicatePolicy {
    /// Parse policy from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dedupe" => Some(Self::Dedupe),
            "keep-all" | "keep_all" => Some(Self::KeepAll),
            "rename-duplicates" | "rename_duplicates" => Some(Self::RenameDuplicates),
            _ => None,
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::Dedupe => write!(f, "dedupe"),
            DuplicatePolicy::KeepAll => write!(f, "keep-all"),
            DuplicatePolicy::RenameDuplicates => write!(f, "rename-duplicates"),
        }
    }
}

/// The state of a run.
///
/// `Idle -> Scanning -> Resolving -> Copying -> Verifying -> Completed`, with
/// `Cancelling -> Cancelled` reachable from any non-terminal state and `Failed`
/// reachable when no further progress is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Scanning,
    Resolving,
    Copying,
    Verifying,
    Completed,
    Cancelling,
    Cancelled,
    Failed,
}

impl RunState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Scanning => "scanning",
            RunState::Resolving => "resolving",
            RunState::Copying => "copying",
            RunState::Verifying => "verifying",
            RunState::Completed => "completed",
            RunState::Cancelling => "cancelling",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate counters for a run. Only the engine mutates these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub files_scanned: u64,
    pub files_copied: u64,
    pub duplicates_skipped: u64,
    /// Entries that would have been copied in a dry run
    pub dry_run_planned: u64,
    /// Takeout JSON sidecars left out of the rebuilt tree
    pub metadata_skipped: u64,
    pub bytes_transferred: u64,
    pub errors: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
}

fn millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

impl RunStatistics {
    pub(crate) fn record(&mut self, outcome: Outcome, bytes: u64) {
        match outcome {
            Outcome::Copied => {
                self.files_copied += 1;
                self.bytes_transferred += bytes;
            }
            Outcome::SkippedDuplicate => self.duplicates_skipped += 1,
            Outcome::SkippedDryRun => self.dry_run_planned += 1,
            Outcome::SkippedMetadata => self.metadata_skipped += 1,
            Outcome::Failed => self.errors += 1,
        }
    }
}

/// Everything the caller gets back from a run.
#[derive(Debug)]
pub struct RunResult {
    pub final_state: RunState,
    pub statistics: RunStatistics,

    /// Manifest file, absent when the run failed before it could be opened
    pub manifest_location: Option<PathBuf>,

    /// Per-entry failures, in processing order
    pub errors: Vec<EntryError>,

    /// Cause of a `Failed` run
    pub fatal: Option<EngineError>,

    /// Present when verification ran
    pub verification: Option<VerificationReport>,
}

impl RunResult {
    /// True only for a completed run without a single entry error or
    /// verification finding.
    pub fn is_clean(&self) -> bool {
        self.final_state == RunState::Completed
            && self.errors.is_empty()
            && self.verification.as_ref().map_or(true, VerificationReport::passed)
    }

    /// Process exit code a CLI should use for this result.
    pub fn exit_code(&self) -> i32 {
        match self.final_state {
            RunState::Failed => 2,
            _ if self.is_clean() => 0,
            _ => 1,
        }
    }
}
