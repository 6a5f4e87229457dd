//! Path resolution: raw Takeout paths to logical Drive paths.
//!
//! A Takeout export wraps the Drive tree in `Takeout*/Drive/` folders (one per
//! archive part) and appends `(N)` to names that would otherwise collide. The
//! resolver removes the wrappers so every part maps onto one logical folder
//! tree, then decides per folder which `(N)` suffixes are export artifacts
//! (same content as the base file) and which mark genuinely distinct files.
//!
//! Resolution of an entry depends only on its raw path and on the set of
//! entries in the same logical folder, never on processing order.

use crate::checksums::ChecksumValue;
use crate::error::PathResolutionError;
use crate::model::{DuplicatePolicy, ResolvedPath, SourceEntry, SuffixVerdict};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

/// Split a raw relative path into logical segments, dropping Takeout wrappers.
///
/// A leading run of `Takeout*` folders (case-insensitive) is removed, followed
/// by at most one `Drive` folder. The file name itself is never removed.
/// Segments keep their platform encoding, so names that are not valid Unicode
/// resolve like any other.
pub fn logical_segments(raw: &Path) -> Result<Vec<OsString>, PathResolutionError> {
    let raw_display = raw.to_string_lossy().into_owned();
    let mut segments = Vec::new();

    for component in raw.components() {
        match component {
            Component::Normal(part) => {
                if part.is_empty() || part == OsStr::new(".") || part == OsStr::new("..") {
                    return Err(PathResolutionError::Traversal { raw: raw_display });
                }
                segments.push(part.to_os_string());
            }
            Component::CurDir
            | Component::ParentDir
            | Component::RootDir
            | Component::Prefix(_) => {
                return Err(PathResolutionError::Traversal { raw: raw_display });
            }
        }
    }

    let mut start = 0;
    while segments.len() - start > 1 && is_takeout_wrapper(&segments[start]) {
        start += 1;
    }
    if segments.len() - start > 1 && segments[start].eq_ignore_ascii_case("drive") {
        start += 1;
    }

    let logical: Vec<OsString> = segments.split_off(start.min(segments.len()));
    if logical.is_empty() {
        return Err(PathResolutionError::Empty { raw: raw_display });
    }
    Ok(logical)
}

fn is_takeout_wrapper(segment: &OsStr) -> bool {
    segment
        .to_string_lossy()
        .get(..7)
        .map(|prefix| prefix.eq_ignore_ascii_case("takeout"))
        .unwrap_or(false)
}

/// A file name split around a Takeout duplicate suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSuffix {
    /// Name with the suffix removed, e.g. `photo.jpg` for `photo (2).jpg`
    pub base_name: OsString,
    /// The number inside the parentheses
    pub number: u32,
}

/// Detect `name(N).ext` / `name (N).ext` / `name(N)`.
///
/// Names that are not valid Unicode never carry a recognised suffix.
pub fn parse_duplicate_suffix<S: AsRef<OsStr> + ?Sized>(file_name: &S) -> Option<DuplicateSuffix> {
    let (stem, ext) = split_extension(file_name.as_ref().to_str()?);
    let stem = stem.strip_suffix(')')?;
    let open = stem.rfind('(')?;
    let digits = &stem[open + 1..];
    if digits.is_empty() || digits.len() > 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number: u32 = digits.parse().ok()?;
    let prefix = &stem[..open];
    let prefix = prefix.strip_suffix(' ').unwrap_or(prefix);
    if prefix.is_empty() {
        return None;
    }
    Some(DuplicateSuffix {
        base_name: format!("{}{}", prefix, ext).into(),
        number,
    })
}

/// Split `name.ext` into (`name`, `.ext`). Dotfiles and names without a dot
/// have no extension.
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(pos) if pos > 0 => file_name.split_at(pos),
        _ => (file_name, ""),
    }
}

/// `photo.jpg` + 2 -> `photo_2.jpg`
pub fn counter_name<S: AsRef<OsStr> + ?Sized>(file_name: &S, counter: u32) -> OsString {
    let name = Path::new(file_name.as_ref());
    let mut renamed = name
        .file_stem()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    renamed.push(format!("_{}", counter));
    if let Some(ext) = name.extension() {
        renamed.push(".");
        renamed.push(ext);
    }
    renamed
}

/// Total order used for canonical-member selection and processing order.
///
/// Export root ascending, then the raw relative path compared segment by
/// segment, where a file name is compared with its duplicate suffix removed
/// first and the suffix number second. That keeps `photo.jpg` ahead of
/// `photo(1).jpg`, which plain byte order would reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableKey {
    export_root: usize,
    folders: Vec<OsString>,
    base_name: OsString,
    suffix: u32,
    raw: OsString,
}

impl StableKey {
    pub fn for_entry(entry: &SourceEntry) -> Self {
        let raw = entry.raw_relative_path.as_os_str().to_os_string();
        let mut folders: Vec<OsString> = entry
            .raw_relative_path
            .components()
            .map(|c| c.as_os_str().to_os_string())
            .collect();
        let file_name = folders.pop().unwrap_or_default();
        let (base_name, suffix) = match parse_duplicate_suffix(&file_name) {
            Some(parsed) => (parsed.base_name, parsed.number),
            None => (file_name, 0),
        };
        StableKey {
            export_root: entry.export_root,
            folders,
            base_name,
            suffix,
            raw,
        }
    }
}

impl Ord for StableKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.export_root
            .cmp(&other.export_root)
            .then_with(|| self.folders.cmp(&other.folders))
            .then_with(|| self.base_name.cmp(&other.base_name))
            .then_with(|| self.suffix.cmp(&other.suffix))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for StableKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One entry as seen from inside its logical folder.
#[derive(Debug, Clone)]
pub struct Sibling {
    /// Index into the run's ordered entry list
    pub index: usize,
    pub file_name: OsString,
    pub hash: ChecksumValue,
}

/// Read-only view of every resolvable entry in one logical folder, in stable
/// order.
#[derive(Debug, Clone, Default)]
pub struct SiblingContext {
    pub folder: Vec<OsString>,
    pub members: Vec<Sibling>,
}

/// Resolves raw Takeout paths under a duplicate policy.
#[derive(Debug, Clone, Copy)]
pub struct PathResolver {
    policy: DuplicatePolicy,
}

impl PathResolver {
    pub fn new(policy: DuplicatePolicy) -> Self {
        PathResolver { policy }
    }

    /// Resolve one entry against the folder it belongs to.
    ///
    /// `siblings` must be the context of the entry's logical folder, and must
    /// contain the entry itself.
    pub fn resolve(
        &self,
        entry_index: usize,
        entry: &SourceEntry,
        siblings: &SiblingContext,
    ) -> Result<ResolvedPath, PathResolutionError> {
        let segments = logical_segments(&entry.raw_relative_path)?;
        let plan = self.plan_folder(siblings);
        let (name, suffix) = plan.get(&entry_index).cloned().unwrap_or_else(|| {
            (segments[segments.len() - 1].clone(), SuffixVerdict::Absent)
        });
        Ok(ResolvedPath {
            logical_path: join_logical(&segments[..segments.len() - 1], &name),
            suffix,
        })
    }

    /// Resolve every entry of a run at once.
    ///
    /// `hashes[i]` is the content hash of `entries[i]`; entries without a hash
    /// (hashing failed) take no part in sibling decisions and resolve to their
    /// own stripped name.
    pub fn resolve_all(
        &self,
        entries: &[SourceEntry],
        hashes: &[Option<ChecksumValue>],
    ) -> Vec<Result<ResolvedPath, PathResolutionError>> {
        let mut results: Vec<Option<Result<ResolvedPath, PathResolutionError>>> =
            vec![None; entries.len()];
        let mut folders: BTreeMap<Vec<OsString>, SiblingContext> = BTreeMap::new();

        for (index, entry) in entries.iter().enumerate() {
            match logical_segments(&entry.raw_relative_path) {
                Ok(mut segments) => {
                    let file_name = segments.pop().unwrap_or_default();
                    match hashes.get(index).and_then(Option::as_ref) {
                        Some(hash) => {
                            let context = folders.entry(segments.clone()).or_insert_with(|| {
                                SiblingContext {
                                    folder: segments,
                                    members: Vec::new(),
                                }
                            });
                            context.members.push(Sibling {
                                index,
                                file_name,
                                hash: hash.clone(),
                            });
                        }
                        None => {
                            results[index] = Some(Ok(ResolvedPath {
                                logical_path: join_logical(&segments, &file_name),
                                suffix: SuffixVerdict::Absent,
                            }));
                        }
                    }
                }
                Err(e) => results[index] = Some(Err(e)),
            }
        }

        for context in folders.values() {
            for (index, (name, suffix)) in self.plan_folder(context) {
                results[index] = Some(Ok(ResolvedPath {
                    logical_path: join_logical(&context.folder, &name),
                    suffix,
                }));
            }
        }

        results
            .into_iter()
            .zip(entries)
            .map(|(result, entry)| {
                result.unwrap_or_else(|| {
                    Err(PathResolutionError::Empty {
                        raw: entry.raw_relative_path.to_string_lossy().into_owned(),
                    })
                })
            })
            .collect()
    }

    /// Assign a final file name to every member of one folder.
    fn plan_folder(&self, context: &SiblingContext) -> HashMap<usize, (OsString, SuffixVerdict)> {
        let mut members: Vec<&Sibling> = context.members.iter().collect();
        members.sort_by_key(|m| m.index);

        let names: BTreeSet<&OsStr> = members.iter().map(|m| m.file_name.as_os_str()).collect();
        let mut suffix_bases: HashMap<OsString, usize> = HashMap::new();
        for member in &members {
            if let Some(parsed) = parse_duplicate_suffix(&member.file_name) {
                *suffix_bases.entry(parsed.base_name).or_insert(0) += 1;
            }
        }

        // A suffix only counts when its base name also occurs in the folder,
        // either as a plain file or as the base of another suffixed file.
        let mut groups: BTreeMap<OsString, Vec<(&Sibling, bool)>> = BTreeMap::new();
        for member in &members {
            let group_key = match parse_duplicate_suffix(&member.file_name) {
                Some(parsed)
                    if names.contains(parsed.base_name.as_os_str())
                        || suffix_bases.get(&parsed.base_name).copied().unwrap_or(0) > 1 =>
                {
                    groups
                        .entry(parsed.base_name)
                        .or_default()
                        .push((*member, true));
                    continue;
                }
                _ => member.file_name.clone(),
            };
            groups.entry(group_key).or_default().push((*member, false));
        }

        let mut taken: BTreeSet<OsString> = groups.keys().cloned().collect();
        let mut plan = HashMap::with_capacity(members.len());

        for (group_name, group) in &groups {
            let mut assigned: Vec<(&ChecksumValue, OsString)> = Vec::new();
            let mut counter = 0u32;

            for (member, has_suffix) in group {
                let same_content = assigned
                    .iter()
                    .find(|(hash, _)| *hash == &member.hash)
                    .map(|(_, name)| name.clone());

                let verdict = match (*has_suffix, same_content.is_some()) {
                    (false, _) => SuffixVerdict::Absent,
                    (true, true) => SuffixVerdict::Artifact,
                    (true, false) if assigned.is_empty() => SuffixVerdict::Artifact,
                    (true, false) => SuffixVerdict::Genuine,
                };

                let name = match same_content {
                    Some(name) if self.policy == DuplicatePolicy::Dedupe => name,
                    _ if assigned.is_empty() => group_name.clone(),
                    _ => loop {
                        counter += 1;
                        let candidate = counter_name(group_name, counter);
                        if taken.insert(candidate.clone()) {
                            break candidate;
                        }
                    },
                };

                assigned.push((&member.hash, name.clone()));
                plan.insert(member.index, (name, verdict));
            }
        }

        plan
    }
}

fn join_logical(folder: &[OsString], file_name: &OsStr) -> PathBuf {
    let mut path: PathBuf = folder.iter().collect();
    path.push(file_name);
    path
}

/// Check that `logical` stays inside `root` once joined.
pub fn destination_for(root: &Path, logical: &Path) -> Result<PathBuf, PathResolutionError> {
    let escapes = logical
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || logical.as_os_str().is_empty() {
        return Err(PathResolutionError::Traversal {
            raw: logical.to_string_lossy().into_owned(),
        });
    }
    Ok(root.join(logical))
}
