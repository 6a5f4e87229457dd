//! Post-copy verification.
//!
//! Re-hashes the destination of every `copied` manifest entry and compares it
//! with the hash recorded when the source was read. Verifying a whole manifest
//! also lists files under the destination root that no entry accounts for.
//! Verification never touches the files and its findings are advisory.

use crate::checksums::{compute_file_checksum, ChecksumValue};
use crate::error::{EngineError, EntryError, ErrorKind};
use crate::manifest::{Manifest, ManifestEntry};
use crate::model::Outcome;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Listing cap per section in [`VerificationReport::render`].
const RENDER_LIMIT: usize = 10;

/// A destination whose content no longer matches its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub expected: ChecksumValue,
    pub actual: ChecksumValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Copied entries examined
    pub checked: u64,
    pub matched: u64,
    pub mismatches: Vec<Mismatch>,
    /// Destinations that no longer exist
    pub missing: Vec<PathBuf>,
    /// Destinations that could not be hashed, with the reason
    pub errors: Vec<(PathBuf, String)>,
    /// Files in the destination tree that no manifest entry accounts for.
    /// Informational, does not affect [`passed`](Self::passed).
    pub unaccounted: Vec<PathBuf>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.missing.is_empty() && self.errors.is_empty()
    }

    /// Mismatches as per-entry errors, keyed by source.
    pub fn entry_errors(&self) -> Vec<EntryError> {
        self.mismatches
            .iter()
            .map(|m| EntryError {
                source: m.source.clone(),
                error_kind: ErrorKind::VerificationMismatch,
                detail: format!(
                    "{}: expected {}, found {}",
                    m.destination.display(),
                    m.expected,
                    m.actual
                ),
            })
            .collect()
    }

    /// Plain-text report for terminals and log files.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = if self.passed() { "PASSED" } else { "FAILED" };
        let _ = writeln!(out, "Verification {}", status);
        let _ = writeln!(out, "  checked:    {}", self.checked);
        let _ = writeln!(out, "  matched:    {}", self.matched);
        let _ = writeln!(out, "  mismatched: {}", self.mismatches.len());
        let _ = writeln!(out, "  missing:    {}", self.missing.len());
        let _ = writeln!(out, "  errors:     {}", self.errors.len());
        if !self.unaccounted.is_empty() {
            let _ = writeln!(out, "  untracked:  {}", self.unaccounted.len());
        }

        if !self.mismatches.is_empty() {
            let _ = writeln!(out, "\nMismatches:");
            for m in self.mismatches.iter().take(RENDER_LIMIT) {
                let _ = writeln!(out, "  {}", m.destination.display());
                let _ = writeln!(out, "    source:   {}", m.source.display());
                let _ = writeln!(out, "    expected: {}", m.expected);
                let _ = writeln!(out, "    actual:   {}", m.actual);
            }
            more(&mut out, self.mismatches.len());
        }

        if !self.missing.is_empty() {
            let _ = writeln!(out, "\nMissing:");
            for path in self.missing.iter().take(RENDER_LIMIT) {
                let _ = writeln!(out, "  {}", path.display());
            }
            more(&mut out, self.missing.len());
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out, "\nErrors:");
            for (path, reason) in self.errors.iter().take(RENDER_LIMIT) {
                let _ = writeln!(out, "  {}: {}", path.display(), reason);
            }
            more(&mut out, self.errors.len());
        }

        if !self.unaccounted.is_empty() {
            let _ = writeln!(out, "\nNot in manifest:");
            for path in self.unaccounted.iter().take(RENDER_LIMIT) {
                let _ = writeln!(out, "  {}", path.display());
            }
            more(&mut out, self.unaccounted.len());
        }

        out
    }
}

fn more(out: &mut String, total: usize) {
    if total > RENDER_LIMIT {
        let _ = writeln!(out, "  ... and {} more", total - RENDER_LIMIT);
    }
}

/// Verify every copied entry of a manifest, then take inventory of its
/// destination root.
pub fn verify(manifest: &Manifest) -> VerificationReport {
    let mut report = verify_entries(&manifest.entries, None);
    if let Some(root) = manifest.destination_root() {
        let skip_dir = manifest.path.parent().unwrap_or(root);
        report.unaccounted = unaccounted_files(root, &manifest.entries, skip_dir);
        if !report.unaccounted.is_empty() {
            info!(
                count = report.unaccounted.len(),
                "destination holds files the manifest does not list"
            );
        }
    }
    report
}

/// Regular files under `root` that are no entry's destination. Hidden entries
/// and everything under `skip_dir` are left out.
fn unaccounted_files(root: &Path, entries: &[ManifestEntry], skip_dir: &Path) -> Vec<PathBuf> {
    let known: HashSet<&Path> = entries
        .iter()
        .filter_map(|e| e.destination.as_deref())
        .collect();

    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_name().to_string_lossy().starts_with('.') || e.path() == skip_dir)
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && !known.contains(e.path()))
        .map(|e| e.into_path())
        .collect()
}

pub fn verify_entries(entries: &[ManifestEntry], timeout: Option<Duration>) -> VerificationReport {
    verify_until(entries, timeout, || false).0
}

/// Verify until `stop` returns true. The flag is checked between entries; the
/// second value tells whether verification was interrupted.
pub(crate) fn verify_until<F: FnMut() -> bool>(
    entries: &[ManifestEntry],
    timeout: Option<Duration>,
    mut stop: F,
) -> (VerificationReport, bool) {
    let mut report = VerificationReport::default();

    for entry in entries.iter().filter(|e| e.outcome == Outcome::Copied) {
        if stop() {
            return (report, true);
        }

        let (destination, expected) = match (&entry.destination, &entry.hash) {
            (Some(destination), Some(expected)) => (destination, expected),
            _ => {
                report.checked += 1;
                report.errors.push((
                    entry.source.clone(),
                    "copied entry has no destination or hash".to_string(),
                ));
                continue;
            }
        };
        report.checked += 1;

        match compute_file_checksum(destination, expected.algorithm(), timeout) {
            Ok(actual) if &actual == expected => {
                debug!(destination = %destination.display(), "verified");
                report.matched += 1;
            }
            Ok(actual) => {
                warn!(
                    destination = %destination.display(),
                    expected = %expected,
                    actual = %actual,
                    "checksum mismatch"
                );
                report.mismatches.push(Mismatch {
                    source: entry.source.clone(),
                    destination: destination.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            Err(EngineError::ReadError { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                warn!(destination = %destination.display(), "copied file is missing");
                report.missing.push(destination.clone());
            }
            Err(e) => {
                warn!(destination = %destination.display(), error = %e, "cannot verify");
                report.errors.push((destination.clone(), e.to_string()));
            }
        }
    }

    (report, false)
}
