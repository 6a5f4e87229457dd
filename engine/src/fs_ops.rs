//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating extracted export roots
//! - Recognising Takeout's JSON metadata sidecars
//! - Copying files atomically (temporary sibling, then rename) with retries
//! - Creating directories recursively

use crate::error::EngineError;
use crate::model::SourceEntry;
use crate::stream::ChunkReader;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Sidecars larger than this are never parsed.
const MAX_SIDECAR_BYTES: u64 = 1024 * 1024;

/// Top-level keys that mark a Google metadata sidecar.
const SIDECAR_KEYS: &[&str] = &["title", "createdTime", "modifiedTime", "mimeType"];

/// Result of walking one export root.
#[derive(Debug, Default)]
pub struct Enumeration {
    pub entries: Vec<SourceEntry>,
    /// Takeout metadata sidecars left out of `entries`
    pub sidecars: Vec<SourceEntry>,
    /// Paths that could not be read during the walk, with the reason
    pub failures: Vec<(PathBuf, String)>,
}

/// Walk an export root and collect its files in file-name order.
///
/// Hidden files and directories and `*.tmp` files are ignored. With
/// `skip_sidecars`, Takeout metadata sidecars go to `sidecars` instead of
/// `entries`.
///
/// # Errors
/// Returns EngineError only if the root itself cannot be read.
pub fn enumerate_root(
    root: &Path,
    export_root: usize,
    skip_sidecars: bool,
) -> Result<Enumeration, EngineError> {
    fs::read_dir(root).map_err(|e| EngineError::ReadError {
        path: root.to_path_buf(),
        source: e,
    })?;

    let mut result = Enumeration::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(e));

    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), error = %e, "unreadable path during scan");
                result.failures.push((path, e.to_string()));
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                result.failures.push((entry.path().to_path_buf(), e.to_string()));
                continue;
            }
        };

        let raw_relative_path = match entry.path().strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let source = SourceEntry {
            source_path: entry.path().to_path_buf(),
            raw_relative_path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            export_root,
        };

        if skip_sidecars && is_google_metadata(entry.path(), metadata.len()) {
            info!(path = %entry.path().display(), "skipping metadata sidecar");
            result.sidecars.push(source);
        } else {
            result.entries.push(source);
        }
    }

    Ok(result)
}

fn is_ignored(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_file() && name.ends_with(".tmp"))
}

/// True for a `.json` file whose top-level object carries a Drive metadata key.
pub fn is_google_metadata(path: &Path, size: u64) -> bool {
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json || size > MAX_SIDECAR_BYTES {
        return false;
    }

    let content = match fs::read(path) {
        Ok(content) => content,
        Err(_) => return false,
    };
    match serde_json::from_slice::<serde_json::Value>(&content) {
        Ok(serde_json::Value::Object(map)) => SIDECAR_KEYS.iter().any(|k| map.contains_key(*k)),
        _ => false,
    }
}

/// Copy `src` to `dst` without ever exposing a partial file at `dst`.
///
/// Data goes to a hidden temporary sibling of `dst`, is synced, gets the source
/// modification time, and is then renamed into place. `stall_limit` bounds the
/// wait for each chunk, not the whole copy. On failure the temporary file is
/// removed.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_atomic(
    src: &Path,
    dst: &Path,
    stall_limit: Duration,
) -> Result<u64, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let temp = temp_path_for(dst);
    let result = copy_to_temp(src, &temp, stall_limit).and_then(|bytes| {
        fs::rename(&temp, dst).map_err(|e| EngineError::WriteError {
            path: dst.to_path_buf(),
            source: e,
        })?;
        Ok(bytes)
    });

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn copy_to_temp(src: &Path, temp: &Path, stall_limit: Duration) -> Result<u64, EngineError> {
    let mut reader = ChunkReader::open(src, COPY_CHUNK_SIZE, stall_limit)?;

    let mut dst_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)
        .map_err(|e| EngineError::WriteError {
            path: temp.to_path_buf(),
            source: e,
        })?;

    let mut bytes_copied = 0u64;
    while let Some(chunk) = reader.next_chunk()? {
        let started = Instant::now();
        dst_file.write_all(&chunk).map_err(|e| EngineError::WriteError {
            path: temp.to_path_buf(),
            source: e,
        })?;
        // A write cannot be interrupted, only caught once it returns
        if started.elapsed() > stall_limit {
            return Err(EngineError::Timeout {
                path: temp.to_path_buf(),
                secs: stall_limit.as_secs(),
            });
        }
        bytes_copied += chunk.len() as u64;
    }

    dst_file.sync_all().map_err(|e| EngineError::WriteError {
        path: temp.to_path_buf(),
        source: e,
    })?;
    drop(dst_file);

    // Preserve modification time if available
    if let Ok(mtime) = fs::metadata(src).and_then(|m| m.modified()) {
        let _ = filetime::set_file_mtime(temp, filetime::FileTime::from_system_time(mtime));
    }

    Ok(bytes_copied)
}

/// `dir/name.ext` -> `dir/.name.ext.<uuid>.partial`
fn temp_path_for(dst: &Path) -> PathBuf {
    let mut temp_name = OsString::from(".");
    temp_name.push(dst.file_name().unwrap_or_default());
    temp_name.push(format!(".{}.partial", Uuid::new_v4().simple()));
    match dst.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Copy with `retries` additional attempts, each starting from scratch.
///
/// # Returns
/// Bytes copied and the number of attempts it took
pub fn copy_with_retries(
    src: &Path,
    dst: &Path,
    timeout: Duration,
    retries: u32,
) -> Result<(u64, u32), EngineError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match copy_file_atomic(src, dst, timeout) {
            Ok(bytes) => return Ok((bytes, attempt)),
            Err(e) if attempt <= retries => {
                warn!(
                    source = %src.display(),
                    attempt,
                    error = %e,
                    "copy failed, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        // Skip if parent is empty path (relative root)
        if parent.as_os_str().is_empty() {
            return Ok(());
        }

        match fs::metadata(parent) {
            Ok(metadata) => {
                if metadata.is_dir() {
                    Ok(())
                } else {
                    Err(EngineError::DirectoryCreationFailed {
                        path: parent.to_path_buf(),
                        source: io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "Parent path exists but is not a directory",
                        ),
                    })
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => Err(EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            }),
        }
    } else {
        Ok(())
    }
}

/// Create `root` if needed and prove a file can be written inside it.
pub fn check_writable(root: &Path) -> io::Result<()> {
    fs::create_dir_all(root)?;
    let marker = root.join(format!(".write-check-{}", Uuid::new_v4().simple()));
    File::create(&marker)?;
    fs::remove_file(&marker)
}

/// Check a root could be created and written without touching the disk.
///
/// Walks up to the nearest existing ancestor, which must be a directory that
/// is not read-only.
pub fn check_creatable(root: &Path) -> io::Result<()> {
    let mut current = Some(root);
    while let Some(path) = current {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => {
                if metadata.permissions().readonly() {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{} is read-only", path.display()),
                    ));
                }
                return Ok(());
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a directory", path.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                current = path.parent().filter(|p| !p.as_os_str().is_empty());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
