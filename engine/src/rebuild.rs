//! Reconstruction run orchestration.
//!
//! A run walks every export root, orders the entries stably, hashes them on a
//! bounded pool, resolves their logical paths with full sibling knowledge, and
//! then copies them one at a time in that stable order. Every processed entry
//! is appended to the manifest before the next one starts.

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue, DuplicateIndex};
use crate::config::RunConfig;
use crate::context::{ActiveRun, RunContext};
use crate::error::{EngineError, EntryError, ErrorKind, PathResolutionError};
use crate::fs_ops;
use crate::manifest::{ManifestEntry, ManifestHeader, ManifestWriter};
use crate::model::{
    DuplicatePolicy, Outcome, ResolvedPath, RunResult, RunState, RunStatistics, SourceEntry,
};
use crate::progress::{EntrySummary, ProgressEvent, ProgressReporter};
use crate::resolver::{counter_name, destination_for, PathResolver, StableKey};
use crate::verify::{self, VerificationReport};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Run a reconstruction on the calling thread.
///
/// # Errors
/// Returns `RunAlreadyActive` if `ctx` already has a run in progress. Every
/// other failure is reported through the returned `RunResult`.
pub fn run(
    ctx: &RunContext,
    config: &RunConfig,
    reporter: Option<&dyn ProgressReporter>,
) -> Result<RunResult, EngineError> {
    let latch = ctx.acquire()?;
    Ok(run_acquired(ctx, config, reporter, latch))
}

/// Run with the latch already held; it is released when this returns.
pub(crate) fn run_acquired(
    ctx: &RunContext,
    config: &RunConfig,
    reporter: Option<&dyn ProgressReporter>,
    _latch: ActiveRun,
) -> RunResult {
    Run::new(ctx, config, reporter).execute()
}

enum Flow {
    Finished(Option<VerificationReport>),
    Cancelled,
}

/// Run-scoped bookkeeping for the copy phase.
struct CopyPlan<'e> {
    destination_root: PathBuf,
    entries: &'e [SourceEntry],
    index: DuplicateIndex,
    /// Every destination the resolver handed out
    planned: HashSet<PathBuf>,
    /// Destinations taken by this run so far
    claimed: HashSet<PathBuf>,
    /// Content already present in the tree: hash -> (source, destination)
    holders: HashMap<ChecksumValue, (PathBuf, PathBuf)>,
}

struct Run<'a> {
    ctx: &'a RunContext,
    config: &'a RunConfig,
    reporter: Option<&'a dyn ProgressReporter>,
    state: RunState,
    statistics: RunStatistics,
    errors: Vec<EntryError>,
    started: Instant,
    last_entry: Option<EntrySummary>,
    since_event: usize,
    manifest: Option<ManifestWriter>,
    /// Copied entries, kept for the verification pass
    copied: Vec<ManifestEntry>,
}

impl<'a> Run<'a> {
    fn new(
        ctx: &'a RunContext,
        config: &'a RunConfig,
        reporter: Option<&'a dyn ProgressReporter>,
    ) -> Self {
        Run {
            ctx,
            config,
            reporter,
            state: RunState::Idle,
            statistics: RunStatistics::default(),
            errors: Vec::new(),
            started: Instant::now(),
            last_entry: None,
            since_event: 0,
            manifest: None,
            copied: Vec::new(),
        }
    }

    fn execute(mut self) -> RunResult {
        info!(
            roots = self.config.source_roots.len(),
            destination = %self.config.destination_root.display(),
            dry_run = self.config.dry_run,
            policy = %self.config.duplicate_policy,
            "starting reconstruction run"
        );

        match self.drive() {
            Ok(Flow::Finished(verification)) => {
                self.finish(RunState::Completed, None, verification)
            }
            Ok(Flow::Cancelled) => {
                info!("cancellation requested, stopping");
                self.transition(RunState::Cancelling);
                self.finish(RunState::Cancelled, None, None)
            }
            Err(e) => {
                error!(error = %e, "run failed");
                self.finish(RunState::Failed, Some(e), None)
            }
        }
    }

    fn drive(&mut self) -> Result<Flow, EngineError> {
        self.config.validate()?;
        self.transition(RunState::Scanning);

        let source_roots: Vec<PathBuf> =
            self.config.source_roots.iter().map(|r| absolute(r)).collect();
        if let Some(missing) = source_roots.iter().find(|root| !root.is_dir()) {
            return Err(EngineError::SourceRootMissing {
                path: missing.clone(),
            });
        }

        let destination_root = absolute(&self.config.destination_root);
        let writable = if self.config.dry_run {
            fs_ops::check_creatable(&destination_root)
        } else {
            fs_ops::check_writable(&destination_root)
        };
        writable.map_err(|e| EngineError::DestinationUnwritable {
            path: destination_root.clone(),
            source: e,
        })?;

        let header = ManifestHeader {
            started_at: self.ctx.now(),
            source_roots: source_roots.clone(),
            destination_root: destination_root.clone(),
            dry_run: self.config.dry_run,
            duplicate_policy: self.config.duplicate_policy,
            hash_algorithm: self.config.hash_algorithm,
        };
        let writer = ManifestWriter::create(&absolute(&self.config.manifest_dir()), header)?;
        info!(manifest = %writer.path().display(), "manifest opened");
        self.manifest = Some(writer);

        let mut entries = Vec::new();
        let mut sidecars = Vec::new();
        let mut scan_failures = Vec::new();
        for (index, root) in source_roots.iter().enumerate() {
            if self.ctx.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let found = fs_ops::enumerate_root(root, index, self.config.skip_metadata_sidecars)?;
            debug!(
                root = %root.display(),
                files = found.entries.len(),
                sidecars = found.sidecars.len(),
                "export root scanned"
            );
            self.statistics.files_scanned += found.entries.len() as u64;
            entries.extend(found.entries);
            sidecars.extend(found.sidecars);
            scan_failures.extend(
                found
                    .failures
                    .into_iter()
                    .map(|(path, reason)| (index, path, reason)),
            );
        }
        entries.sort_by_cached_key(StableKey::for_entry);
        sidecars.sort_by_cached_key(StableKey::for_entry);
        info!(
            files = entries.len(),
            sidecars = sidecars.len(),
            "scan finished"
        );

        for sidecar in &sidecars {
            let mut record = self.draft(sidecar);
            record.outcome = Outcome::SkippedMetadata;
            self.record(record, 0)?;
        }

        for (export_root, path, reason) in scan_failures {
            let entry = ManifestEntry {
                export_root,
                ..self.draft_for(&path)
            };
            self.record(fail(entry, ErrorKind::Copy, reason), 0)?;
        }

        if self.ctx.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.transition(RunState::Resolving);

        let hashed = match self.hash_entries(&entries)? {
            Some(hashed) => hashed,
            None => return Ok(Flow::Cancelled),
        };
        let mut index = DuplicateIndex::new();
        let mut digests = Vec::with_capacity(hashed.len());
        let mut hash_failures = Vec::with_capacity(hashed.len());
        for (position, result) in hashed.into_iter().enumerate() {
            match result {
                Ok(hash) => {
                    index.insert(hash.clone(), position);
                    digests.push(Some(hash));
                    hash_failures.push(None);
                }
                Err(e) => {
                    digests.push(None);
                    hash_failures.push(Some(e.to_string()));
                }
            }
        }

        let resolved =
            PathResolver::new(self.config.duplicate_policy).resolve_all(&entries, &digests);
        let planned = resolved
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| destination_root.join(&r.logical_path))
            .collect();
        debug!(
            groups = index.len(),
            duplicate_groups = index.duplicate_groups().count(),
            "content index built"
        );

        if self.ctx.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.transition(RunState::Copying);

        let mut plan = CopyPlan {
            destination_root,
            entries: &entries,
            index,
            planned,
            claimed: HashSet::new(),
            holders: HashMap::new(),
        };
        for (position, entry) in entries.iter().enumerate() {
            if self.ctx.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let hash = match (&digests[position], &hash_failures[position]) {
                (Some(hash), _) => Ok(hash),
                (None, Some(reason)) => Err(reason.as_str()),
                (None, None) => Err("no hash computed"),
            };
            let (record, bytes) =
                self.process_entry(position, entry, hash, &resolved[position], &mut plan);
            self.record(record, bytes)?;
        }
        info!(
            copied = self.statistics.files_copied,
            duplicates = self.statistics.duplicates_skipped,
            planned = self.statistics.dry_run_planned,
            errors = self.statistics.errors,
            "copy phase finished"
        );

        if !self.config.verify {
            return Ok(Flow::Finished(None));
        }
        if self.config.dry_run {
            info!("dry run, skipping verification");
            return Ok(Flow::Finished(None));
        }

        self.transition(RunState::Verifying);
        let ctx = self.ctx;
        let (report, interrupted) = verify::verify_until(
            &self.copied,
            Some(self.config.operation_timeout()),
            || ctx.is_cancelled(),
        );
        if interrupted {
            return Ok(Flow::Cancelled);
        }
        info!(
            checked = report.checked,
            matched = report.matched,
            mismatched = report.mismatches.len(),
            missing = report.missing.len(),
            "verification finished"
        );
        self.errors.extend(report.entry_errors());
        Ok(Flow::Finished(Some(report)))
    }

    /// Hash every entry on a bounded pool. `None` means the run was cancelled.
    fn hash_entries(
        &self,
        entries: &[SourceEntry],
    ) -> Result<Option<Vec<Result<ChecksumValue, EngineError>>>, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.hash_workers)
            .thread_name(|i| format!("takeout-hash-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerPool {
                reason: e.to_string(),
            })?;

        let ctx = self.ctx;
        let algorithm = self.config.hash_algorithm;
        let timeout = self.config.operation_timeout();
        let retries = self.config.retry_count;

        let hashed: Vec<Option<Result<ChecksumValue, EngineError>>> = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    if ctx.is_cancelled() {
                        return None;
                    }
                    Some(hash_with_retries(&entry.source_path, algorithm, timeout, retries))
                })
                .collect()
        });

        Ok(hashed.into_iter().collect())
    }

    /// Decide and perform the operation for one entry.
    fn process_entry(
        &self,
        position: usize,
        entry: &SourceEntry,
        hash: Result<&ChecksumValue, &str>,
        resolved: &Result<ResolvedPath, PathResolutionError>,
        plan: &mut CopyPlan<'_>,
    ) -> (ManifestEntry, u64) {
        let mut record = self.draft(entry);

        let hash = match hash {
            Ok(hash) => hash.clone(),
            Err(reason) => return (fail(record, ErrorKind::Hash, reason), 0),
        };
        record.hash = Some(hash.clone());

        let logical = match resolved {
            Ok(resolved) => resolved,
            Err(e) => return (fail(record, ErrorKind::PathResolution, e), 0),
        };
        let target = destination_for(&plan.destination_root, &logical.logical_path);
        let mut destination = match target {
            Ok(destination) => destination,
            Err(e) => return (fail(record, ErrorKind::PathResolution, e), 0),
        };

        let canonical = plan.index.canonical_for(&hash);
        match self.config.duplicate_policy {
            DuplicatePolicy::Dedupe => {
                if let Some((holder_source, holder_destination)) = plan.holders.get(&hash) {
                    debug!(
                        source = %entry.source_path.display(),
                        canonical = %holder_source.display(),
                        "duplicate content, skipping"
                    );
                    record.destination = Some(holder_destination.clone());
                    record.duplicate_of = Some(holder_source.clone());
                    record.outcome = Outcome::SkippedDuplicate;
                    return (record, 0);
                }
            }
            DuplicatePolicy::RenameDuplicates => {
                if let Some(canonical) = canonical.filter(|c| *c != position) {
                    record.duplicate_of = plan
                        .entries
                        .get(canonical)
                        .map(|c| c.source_path.clone());
                }
            }
            DuplicatePolicy::KeepAll => {}
        }

        let taken_by_run = plan.claimed.contains(&destination);
        if taken_by_run || destination.exists() {
            if !taken_by_run {
                let existing = compute_file_checksum(
                    &destination,
                    hash.algorithm(),
                    Some(self.config.operation_timeout()),
                );
                if matches!(&existing, Ok(existing) if *existing == hash) {
                    debug!(
                        destination = %destination.display(),
                        "identical file already at destination"
                    );
                    plan.holders
                        .entry(hash)
                        .or_insert_with(|| (entry.source_path.clone(), destination.clone()));
                    record.destination = Some(destination);
                    record.outcome = Outcome::SkippedDuplicate;
                    return (record, 0);
                }
            }
            let redirected = next_free_name(&destination, &plan.planned, &plan.claimed);
            info!(
                from = %destination.display(),
                to = %redirected.display(),
                "destination occupied by different content, redirecting"
            );
            destination = redirected;
        }

        record.destination = Some(destination.clone());
        plan.claimed.insert(destination.clone());

        if self.config.dry_run {
            plan.holders
                .entry(hash)
                .or_insert_with(|| (entry.source_path.clone(), destination));
            record.outcome = Outcome::SkippedDryRun;
            return (record, 0);
        }

        if let Err(e) = fs_ops::ensure_parent_dir_exists(&destination) {
            plan.claimed.remove(&destination);
            return (fail(record, ErrorKind::Copy, e), 0);
        }
        match fs_ops::copy_with_retries(
            &entry.source_path,
            &destination,
            self.config.operation_timeout(),
            self.config.retry_count,
        ) {
            Ok((bytes, attempts)) => {
                debug!(
                    source = %entry.source_path.display(),
                    destination = %destination.display(),
                    bytes,
                    attempts,
                    "copied"
                );
                plan.holders
                    .entry(hash)
                    .or_insert_with(|| (entry.source_path.clone(), destination));
                record.outcome = Outcome::Copied;
                (record, bytes)
            }
            Err(e) => {
                // Nothing landed there, a later entry may take the name
                plan.claimed.remove(&destination);
                (fail(record, ErrorKind::Copy, e), 0)
            }
        }
    }

    /// Append one entry to the manifest and account for it.
    fn record(&mut self, mut entry: ManifestEntry, bytes: u64) -> Result<(), EngineError> {
        if let Some(writer) = self.manifest.as_mut() {
            entry.sequence = writer.len();
            writer.append(entry.clone())?;
        }

        self.statistics.record(entry.outcome, bytes);
        if let (Some(error_kind), Some(detail)) = (entry.error_kind, &entry.error) {
            self.errors.push(EntryError {
                source: entry.source.clone(),
                error_kind,
                detail: detail.clone(),
            });
        }
        self.last_entry = Some(EntrySummary {
            source: entry.source.clone(),
            destination: entry.destination.clone(),
            outcome: entry.outcome,
        });
        if entry.outcome == Outcome::Copied {
            self.copied.push(entry);
        }

        self.since_event += 1;
        if self.since_event >= self.config.progress_batch_size {
            self.emit();
        }
        Ok(())
    }

    fn draft(&self, entry: &SourceEntry) -> ManifestEntry {
        ManifestEntry {
            export_root: entry.export_root,
            size: entry.size,
            ..self.draft_for(&entry.source_path)
        }
    }

    fn draft_for(&self, source: &Path) -> ManifestEntry {
        ManifestEntry {
            sequence: 0,
            source: source.to_path_buf(),
            export_root: 0,
            destination: None,
            size: 0,
            hash: None,
            outcome: Outcome::Failed,
            duplicate_of: None,
            error_kind: None,
            error: None,
            timestamp: self.ctx.now(),
        }
    }

    fn transition(&mut self, state: RunState) {
        info!(from = %self.state, to = %state, "run state changed");
        self.state = state;
        self.emit();
    }

    fn emit(&mut self) {
        self.since_event = 0;
        if let Some(reporter) = self.reporter {
            let mut statistics = self.statistics.clone();
            statistics.elapsed = self.started.elapsed();
            reporter.report(&ProgressEvent {
                state: self.state,
                statistics,
                last_entry: self.last_entry.clone(),
                timestamp: self.ctx.now(),
            });
        }
    }

    fn finish(
        mut self,
        state: RunState,
        fatal: Option<EngineError>,
        verification: Option<VerificationReport>,
    ) -> RunResult {
        let mut state = state;
        let mut fatal = fatal;

        let manifest_location = self.manifest.take().map(|writer| {
            let path = writer.path().to_path_buf();
            if let Err(e) = writer.finalize(state, self.ctx.now()) {
                error!(error = %e, "failed to finalize manifest");
                if fatal.is_none() {
                    fatal = Some(e);
                    state = RunState::Failed;
                }
            }
            path
        });

        self.statistics.elapsed = self.started.elapsed();
        self.transition(state);
        info!(
            state = %state,
            scanned = self.statistics.files_scanned,
            copied = self.statistics.files_copied,
            bytes = self.statistics.bytes_transferred,
            errors = self.statistics.errors,
            elapsed_ms = self.statistics.elapsed.as_millis() as u64,
            "run finished"
        );

        RunResult {
            final_state: state,
            statistics: self.statistics,
            manifest_location,
            errors: self.errors,
            fatal,
            verification,
        }
    }
}

fn fail(mut record: ManifestEntry, kind: ErrorKind, detail: impl ToString) -> ManifestEntry {
    let detail = detail.to_string();
    warn!(source = %record.source.display(), kind = %kind, error = %detail, "entry failed");
    record.outcome = Outcome::Failed;
    record.error_kind = Some(kind);
    record.error = Some(detail);
    record
}

fn hash_with_retries(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    timeout: Duration,
    retries: u32,
) -> Result<ChecksumValue, EngineError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match compute_file_checksum(path, algorithm, Some(timeout)) {
            Ok(hash) => return Ok(hash),
            Err(e) if attempt <= retries => {
                warn!(source = %path.display(), attempt, error = %e, "hash failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// First `name_N.ext` sibling that is neither on disk nor handed out by this run.
fn next_free_name(
    destination: &Path,
    planned: &HashSet<PathBuf>,
    claimed: &HashSet<PathBuf>,
) -> PathBuf {
    let file_name = destination.file_name().unwrap_or_default();
    let mut counter = 0;
    loop {
        counter += 1;
        let candidate = destination.with_file_name(counter_name(file_name, counter));
        if !candidate.exists() && !planned.contains(&candidate) && !claimed.contains(&candidate) {
            return candidate;
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FixedClock;
    use crate::manifest::Manifest;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::sync::{Arc, Mutex};

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create source dir");
        }
        fs::write(&path, content).expect("Failed to write source file");
    }

    fn config(temp: &Path, roots: Vec<PathBuf>) -> RunConfig {
        let mut config = RunConfig::new(roots, temp.join("restore"));
        config.manifest_dir = Some(temp.join("logs"));
        config.hash_workers = 2;
        config
    }

    fn load(result: &RunResult) -> Manifest {
        let path = result
            .manifest_location
            .as_ref()
            .expect("run should have a manifest");
        Manifest::load(path).expect("Failed to load manifest")
    }

    fn outcomes(manifest: &Manifest) -> Vec<Outcome> {
        manifest.entries.iter().map(|e| e.outcome).collect()
    }

    fn fixed_context() -> RunContext {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        RunContext::with_clock(Arc::new(FixedClock::new(at)))
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressReporter for Recorder {
        fn report(&self, event: &ProgressEvent) {
            self.events.lock().expect("lock").push(event.clone());
        }
    }

    /// Removes a source file when the run enters `state`.
    struct RemoveOnState {
        state: RunState,
        path: PathBuf,
    }

    impl ProgressReporter for RemoveOnState {
        fn report(&self, event: &ProgressEvent) {
            if event.state == self.state {
                let _ = fs::remove_file(&self.path);
            }
        }
    }

    struct CancelAfterFirstEntry {
        ctx: RunContext,
    }

    impl ProgressReporter for CancelAfterFirstEntry {
        fn report(&self, event: &ProgressEvent) {
            if event.last_entry.is_some() {
                self.ctx.cancel();
            }
        }
    }

    #[test]
    fn test_dedupe_collapses_identical_suffix() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "A/photo.jpg", b"same pixels");
        write(&root, "A/photo(1).jpg", b"same pixels");
        write(&root, "A/notes.txt", b"unique");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root.clone()]), None)
            .expect("run should start");

        assert_eq!(result.final_state, RunState::Completed);
        assert!(result.is_clean());
        let manifest = load(&result);
        assert!(manifest.is_finalized());
        assert_eq!(manifest.entries.len(), 3);
        assert_eq!(
            outcomes(&manifest),
            vec![Outcome::Copied, Outcome::Copied, Outcome::SkippedDuplicate]
        );
        assert_eq!(
            manifest.entries[2].duplicate_of,
            Some(root.join("A/photo.jpg"))
        );

        let dest = temp_dir.path().join("restore");
        assert_eq!(fs::read(dest.join("A/photo.jpg")).expect("read"), b"same pixels");
        assert_eq!(fs::read(dest.join("A/notes.txt")).expect("read"), b"unique");
        assert!(!dest.join("A/photo(1).jpg").exists());
        assert!(!dest.join("A/photo_1.jpg").exists());

        assert_eq!(result.statistics.files_scanned, 3);
        assert_eq!(result.statistics.files_copied, 2);
        assert_eq!(result.statistics.duplicates_skipped, 1);
        assert_eq!(result.statistics.bytes_transferred, 17);
    }

    #[test]
    fn test_merged_roots_keep_both_versions() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let part1 = temp_dir.path().join("part1");
        let part2 = temp_dir.path().join("part2");
        write(&part1, "Takeout/Drive/Album/img1.png", b"first");
        write(&part2, "Takeout/Drive/Album/img1.png", b"second");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![part1, part2]), None)
            .expect("run should start");

        assert!(result.is_clean());
        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Copied, Outcome::Copied]);

        let album = temp_dir.path().join("restore/Album");
        assert_eq!(fs::read(album.join("img1.png")).expect("read"), b"first");
        assert_eq!(fs::read(album.join("img1_1.png")).expect("read"), b"second");
    }

    #[test]
    fn test_dedupe_copies_one_member_per_group() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "A/photo.jpg", b"dup");
        write(&root, "A/photo(1).jpg", b"dup");
        write(&root, "B/copy.jpg", b"dup");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root]), None).expect("run");

        let manifest = load(&result);
        let copied = manifest.copied().count();
        assert_eq!(copied, 1);
        assert_eq!(result.statistics.duplicates_skipped, 2);
        assert!(!temp_dir.path().join("restore/B/copy.jpg").exists());
    }

    #[test]
    fn test_keep_all_copies_every_member() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "A/photo.jpg", b"dup");
        write(&root, "A/photo(1).jpg", b"dup");
        write(&root, "B/copy.jpg", b"dup");

        let mut config = config(temp_dir.path(), vec![root]);
        config.duplicate_policy = DuplicatePolicy::KeepAll;
        let ctx = RunContext::new();
        let result = run(&ctx, &config, None).expect("run");

        let manifest = load(&result);
        assert!(manifest.entries.iter().all(|e| e.outcome == Outcome::Copied));
        assert!(manifest.entries.iter().all(|e| e.duplicate_of.is_none()));
        let dest = temp_dir.path().join("restore");
        assert!(dest.join("A/photo.jpg").exists());
        assert!(dest.join("A/photo_1.jpg").exists());
        assert!(dest.join("B/copy.jpg").exists());
    }

    #[test]
    fn test_rename_duplicates_flags_without_skipping() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "A/photo.jpg", b"dup");
        write(&root, "B/copy.jpg", b"dup");

        let mut config = config(temp_dir.path(), vec![root.clone()]);
        config.duplicate_policy = DuplicatePolicy::RenameDuplicates;
        let ctx = RunContext::new();
        let result = run(&ctx, &config, None).expect("run");

        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Copied, Outcome::Copied]);
        assert_eq!(manifest.entries[0].duplicate_of, None);
        assert_eq!(
            manifest.entries[1].duplicate_of,
            Some(root.join("A/photo.jpg"))
        );
    }

    #[test]
    fn test_dry_run_leaves_destination_untouched() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "A/photo.jpg", b"dup");
        write(&root, "A/photo(1).jpg", b"dup");
        write(&root, "A/notes.txt", b"unique");

        let mut config = config(temp_dir.path(), vec![root]);
        config.manifest_dir = None;
        config.dry_run = true;
        let ctx = RunContext::new();
        let result = run(&ctx, &config, None).expect("run");

        assert_eq!(result.final_state, RunState::Completed);
        assert!(!temp_dir.path().join("restore").exists());

        let manifest = load(&result);
        assert_eq!(
            outcomes(&manifest),
            vec![
                Outcome::SkippedDryRun,
                Outcome::SkippedDryRun,
                Outcome::SkippedDuplicate
            ]
        );
        assert_eq!(result.statistics.dry_run_planned, 2);
        assert_eq!(result.statistics.files_copied, 0);
        assert!(manifest
            .path
            .starts_with(temp_dir.path().join(crate::config::DEFAULT_LOG_DIR_NAME)));
    }

    #[test]
    fn test_empty_source_roots_complete_with_empty_manifest() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![]), None).expect("run");

        assert_eq!(result.final_state, RunState::Completed);
        assert_eq!(result.exit_code(), 0);
        let mut statistics = result.statistics.clone();
        statistics.elapsed = Duration::ZERO;
        assert_eq!(statistics, RunStatistics::default());

        let manifest = load(&result);
        assert!(manifest.is_finalized());
        assert!(manifest.entries.is_empty());
    }

    #[test]
    fn test_zero_byte_file_is_copied() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "empty.txt", b"");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root]), None).expect("run");

        assert!(result.is_clean());
        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Copied]);
        assert!(manifest.entries[0].hash.is_some());
        let copied = temp_dir.path().join("restore/empty.txt");
        assert_eq!(fs::metadata(&copied).expect("metadata").len(), 0);
    }

    #[test]
    fn test_uncreatable_destination_fails_run() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "a.txt", b"data");
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").expect("write");

        let mut config = config(temp_dir.path(), vec![root]);
        config.destination_root = blocker.join("restore");
        let ctx = RunContext::new();
        let result = run(&ctx, &config, None).expect("run");

        assert_eq!(result.final_state, RunState::Failed);
        assert_eq!(result.exit_code(), 2);
        assert_eq!(result.statistics.files_copied, 0);
        assert!(result.manifest_location.is_none());
        assert!(matches!(
            result.fatal,
            Some(EngineError::DestinationUnwritable { .. })
        ));
        assert!(!ctx.is_active());
    }

    #[test]
    fn test_missing_source_root_fails_run() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let ctx = RunContext::new();
        let result = run(
            &ctx,
            &config(temp_dir.path(), vec![temp_dir.path().join("nope")]),
            None,
        )
        .expect("run");

        assert_eq!(result.final_state, RunState::Failed);
        assert!(matches!(
            result.fatal,
            Some(EngineError::SourceRootMissing { .. })
        ));
    }

    #[test]
    fn test_invalid_config_fails_run() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = config(temp_dir.path(), vec![]);
        config.progress_batch_size = 0;

        let ctx = RunContext::new();
        let result = run(&ctx, &config, None).expect("run");
        assert_eq!(result.final_state, RunState::Failed);
        assert!(matches!(result.fatal, Some(EngineError::InvalidConfig { .. })));
    }

    #[test]
    fn test_second_run_on_active_context_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let ctx = RunContext::new();
        let _latch = ctx.acquire().expect("acquire");

        let result = run(&ctx, &config(temp_dir.path(), vec![]), None);
        assert!(matches!(result, Err(EngineError::RunAlreadyActive)));
        assert!(!temp_dir.path().join("logs").exists());
    }

    #[test]
    fn test_identical_inputs_give_identical_manifests() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let part1 = temp_dir.path().join("part1");
        let part2 = temp_dir.path().join("part2");
        write(&part1, "Takeout/Drive/A/photo.jpg", b"x");
        write(&part1, "Takeout/Drive/A/photo(1).jpg", b"y");
        write(&part2, "Takeout 2/Drive/A/photo.jpg", b"x");
        write(&part2, "Takeout 2/Drive/B/doc.txt", b"z");

        let mut config = config(temp_dir.path(), vec![part1, part2]);
        config.dry_run = true;
        config.hash_workers = 4;

        let ctx = fixed_context();
        let first = run(&ctx, &config, None).expect("run");
        let second = run(&ctx, &config, None).expect("run");

        let first_path = first.manifest_location.expect("manifest");
        let second_path = second.manifest_location.expect("manifest");
        assert_ne!(first_path, second_path);
        assert_eq!(
            fs::read(&first_path).expect("read"),
            fs::read(&second_path).expect("read")
        );
    }

    #[test]
    fn test_existing_identical_destination_is_skipped() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "notes.txt", b"same");
        write(&temp_dir.path().join("restore"), "notes.txt", b"same");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root]), None).expect("run");

        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::SkippedDuplicate]);
        assert_eq!(manifest.entries[0].duplicate_of, None);
    }

    #[test]
    fn test_existing_different_destination_is_never_overwritten() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        let dest = temp_dir.path().join("restore");
        write(&root, "notes.txt", b"new");
        write(&dest, "notes.txt", b"old");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root]), None).expect("run");

        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Copied]);
        assert_eq!(manifest.entries[0].destination, Some(dest.join("notes_1.txt")));
        assert_eq!(fs::read(dest.join("notes.txt")).expect("read"), b"old");
        assert_eq!(fs::read(dest.join("notes_1.txt")).expect("read"), b"new");
    }

    #[test]
    fn test_cancellation_stops_after_in_flight_entry() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "a.txt", b"a");
        write(&root, "b.txt", b"b");
        write(&root, "c.txt", b"c");

        let mut config = config(temp_dir.path(), vec![root]);
        config.progress_batch_size = 1;
        let ctx = RunContext::new();
        let reporter = CancelAfterFirstEntry { ctx: ctx.clone() };
        let result = run(&ctx, &config, Some(&reporter)).expect("run");

        assert_eq!(result.final_state, RunState::Cancelled);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.statistics.files_copied, 1);

        let manifest = load(&result);
        assert!(manifest.is_finalized());
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(
            manifest.trailer.as_ref().map(|t| t.final_state),
            Some(RunState::Cancelled)
        );
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_active());
    }

    #[test]
    fn test_metadata_sidecars_are_not_copied() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "Docs/report.pdf", b"%PDF");
        write(
            &root,
            "Docs/report.pdf.json",
            br#"{"title": "report.pdf", "mimeType": "application/pdf"}"#,
        );

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root]), None).expect("run");

        assert_eq!(result.statistics.metadata_skipped, 1);
        assert_eq!(result.statistics.files_copied, 1);
        assert!(!temp_dir.path().join("restore/Docs/report.pdf.json").exists());
        assert!(result.is_clean());

        let manifest = load(&result);
        assert_eq!(
            outcomes(&manifest),
            vec![Outcome::SkippedMetadata, Outcome::Copied]
        );
        assert!(manifest.entries[0].source.ends_with("Docs/report.pdf.json"));
        assert_eq!(manifest.entries[0].destination, None);
    }

    #[test]
    fn test_progress_events_at_transitions_and_batches() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        for name in ["1.txt", "2.txt", "3.txt", "4.txt", "5.txt"] {
            write(&root, name, name.as_bytes());
        }

        let mut config = config(temp_dir.path(), vec![root]);
        config.progress_batch_size = 2;
        let recorder = Recorder::default();
        let ctx = RunContext::new();
        let result = run(&ctx, &config, Some(&recorder)).expect("run");
        assert!(result.is_clean());

        let events = recorder.events.lock().expect("lock");
        let states: Vec<RunState> = events.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                RunState::Scanning,
                RunState::Resolving,
                RunState::Copying,
                RunState::Copying,
                RunState::Copying,
                RunState::Completed
            ]
        );
        assert_eq!(events[3].statistics.files_copied, 2);
        assert_eq!(events[4].statistics.files_copied, 4);
        let last = events.last().expect("final event");
        assert_eq!(last.statistics.files_copied, 5);
        assert!(last.last_entry.is_some());
    }

    #[test]
    fn test_verification_runs_when_enabled() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "a.txt", b"alpha");
        write(&root, "b.txt", b"beta");

        let mut config = config(temp_dir.path(), vec![root]);
        config.verify = true;
        let recorder = Recorder::default();
        let ctx = RunContext::new();
        let result = run(&ctx, &config, Some(&recorder)).expect("run");

        let report = result.verification.as_ref().expect("verification report");
        assert!(report.passed());
        assert_eq!(report.checked, 2);
        assert!(result.is_clean());
        let events = recorder.events.lock().expect("lock");
        assert!(events.iter().any(|e| e.state == RunState::Verifying));
    }

    #[test]
    fn test_manifest_sequence_follows_processing_order() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let part1 = temp_dir.path().join("part1");
        let part2 = temp_dir.path().join("part2");
        write(&part2, "Takeout/Drive/a.txt", b"2a");
        write(&part1, "Takeout/Drive/z.txt", b"1z");
        write(&part1, "Takeout/Drive/b.txt", b"1b");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![part1, part2]), None).expect("run");

        let manifest = load(&result);
        let sequences: Vec<u64> = manifest.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        let roots: Vec<usize> = manifest.entries.iter().map(|e| e.export_root).collect();
        assert_eq!(roots, vec![0, 0, 1]);
        assert!(manifest.entries[0].source.ends_with("b.txt"));
    }

    #[test]
    fn test_entry_failure_keeps_run_completed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "a.txt", b"alpha");
        write(&root, "b.txt", b"beta");

        let ctx = RunContext::new();
        let reporter = RemoveOnState {
            state: RunState::Resolving,
            path: root.join("a.txt"),
        };
        let result =
            run(&ctx, &config(temp_dir.path(), vec![root.clone()]), Some(&reporter)).expect("run");

        assert_eq!(result.final_state, RunState::Completed);
        assert!(result.fatal.is_none());
        assert!(!result.is_clean());
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.statistics.errors, 1);
        assert_eq!(result.statistics.files_copied, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].source, root.join("a.txt"));
        assert_eq!(result.errors[0].error_kind, ErrorKind::Hash);

        let manifest = load(&result);
        assert!(manifest.is_finalized());
        assert_eq!(outcomes(&manifest), vec![Outcome::Failed, Outcome::Copied]);
        assert_eq!(manifest.entries[0].error_kind, Some(ErrorKind::Hash));
        assert!(manifest.entries[0].error.is_some());
    }

    #[test]
    fn test_failed_canonical_copy_still_copies_duplicate() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "A/photo.jpg", b"same pixels");
        write(&root, "A/photo(1).jpg", b"same pixels");

        let mut config = config(temp_dir.path(), vec![root.clone()]);
        config.retry_count = 0;
        let ctx = RunContext::new();
        let reporter = RemoveOnState {
            state: RunState::Copying,
            path: root.join("A/photo.jpg"),
        };
        let result = run(&ctx, &config, Some(&reporter)).expect("run");

        assert_eq!(result.final_state, RunState::Completed);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].error_kind, ErrorKind::Copy);

        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Failed, Outcome::Copied]);
        let dest = temp_dir.path().join("restore");
        assert_eq!(manifest.entries[1].destination, Some(dest.join("A/photo.jpg")));
        assert_eq!(manifest.entries[1].duplicate_of, None);
        assert_eq!(fs::read(dest.join("A/photo.jpg")).expect("read"), b"same pixels");
        assert!(!dest.join("A/photo_1.jpg").exists());
    }

    /// Swaps a source file for a FIFO nobody writes to.
    #[cfg(target_os = "linux")]
    struct StallOnState {
        state: RunState,
        path: PathBuf,
    }

    #[cfg(target_os = "linux")]
    impl ProgressReporter for StallOnState {
        fn report(&self, event: &ProgressEvent) {
            if event.state == self.state && self.path.is_file() {
                fs::remove_file(&self.path).expect("Failed to remove source");
                let status = std::process::Command::new("mkfifo")
                    .arg(&self.path)
                    .status()
                    .expect("Failed to run mkfifo");
                assert!(status.success());
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stalled_read_fails_entry_with_timeout() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        write(&root, "slow.bin", b"never read");
        write(&root, "fast.txt", b"fine");

        let mut config = config(temp_dir.path(), vec![root.clone()]);
        config.operation_timeout_secs = 1;
        config.retry_count = 0;
        let ctx = RunContext::new();
        let reporter = StallOnState {
            state: RunState::Resolving,
            path: root.join("slow.bin"),
        };
        let result = run(&ctx, &config, Some(&reporter)).expect("run");

        assert_eq!(result.final_state, RunState::Completed);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.statistics.files_copied, 1);

        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Copied, Outcome::Failed]);
        let stalled = &manifest.entries[1];
        assert!(stalled.source.ends_with("slow.bin"));
        assert_eq!(stalled.error_kind, Some(ErrorKind::Hash));
        assert!(stalled
            .error
            .as_deref()
            .map_or(false, |e| e.starts_with("No progress for 1s")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_file_name_is_copied() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("export");
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        let source = root.join("Takeout/Drive/Docs").join(name);
        fs::create_dir_all(source.parent().expect("parent")).expect("Failed to create dir");
        fs::write(&source, b"latin-1 name").expect("Failed to write source file");

        let ctx = RunContext::new();
        let result = run(&ctx, &config(temp_dir.path(), vec![root]), None).expect("run");

        assert_eq!(result.final_state, RunState::Completed);
        assert_eq!(result.exit_code(), 0);

        let manifest = load(&result);
        assert_eq!(outcomes(&manifest), vec![Outcome::Copied]);
        assert_eq!(manifest.entries[0].source, source);
        let destination = temp_dir.path().join("restore/Docs").join(name);
        assert_eq!(manifest.entries[0].destination, Some(destination.clone()));
        assert_eq!(fs::read(&destination).expect("read"), b"latin-1 name");
    }
}
