//! Error types for the reconstruction engine.
//!
//! `EngineError` represents run-level problems (bad configuration, an unwritable
//! destination, a manifest that cannot be read) and the low-level I/O failures
//! returned by `fs_ops` and `checksums`. Per-file failures never escape a run:
//! the engine converts them into an [`EntryError`] and records them in the
//! manifest.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the engine.
///
/// Only `RunAlreadyActive` is ever returned from `run` as an `Err`; every other
/// fatal condition ends the run in the `Failed` state with the error attached
/// to the `RunResult`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration value missing, out of range, or unknown
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A configured source root does not exist or is not a directory
    #[error("Source root not found: {}", path.display())]
    SourceRootMissing { path: PathBuf },

    /// Destination root cannot be created or written
    #[error("Destination is not writable: {}", path.display())]
    DestinationUnwritable { path: PathBuf, source: io::Error },

    /// Another run holds the context's active-run latch
    #[error("A reconstruction run is already active")]
    RunAlreadyActive,

    /// Failed to read from source file
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to destination file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// A read or write made no progress within the stall limit
    #[error("No progress for {secs}s: {}", path.display())]
    Timeout { path: PathBuf, secs: u64 },

    /// Manifest could not be created or appended to
    #[error("Failed to write manifest: {}", path.display())]
    ManifestWrite { path: PathBuf, source: io::Error },

    /// Manifest could not be opened or read
    #[error("Failed to read manifest: {}", path.display())]
    ManifestRead { path: PathBuf, source: io::Error },

    /// A manifest line is not a valid record
    #[error("Malformed manifest {} at line {line}: {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    /// Rollback requires the trailer written at the end of a run
    #[error("Manifest was never finalized: {}", path.display())]
    ManifestNotFinalized { path: PathBuf },

    /// The hashing thread pool could not be built
    #[error("Failed to start worker pool: {reason}")]
    WorkerPool { reason: String },

    /// The background run thread panicked
    #[error("Run worker thread panicked")]
    WorkerPanicked,
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::DestinationUnwritable { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::ManifestWrite { source, .. }
            | Self::ManifestRead { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        EngineError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Classification of a per-entry failure, persisted in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Raw path could not be mapped to a destination
    PathResolution,
    /// I/O failure while copying, after all retries
    Copy,
    /// Source unreadable while hashing
    Hash,
    /// Destination content differs from the recorded hash (advisory)
    VerificationMismatch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::PathResolution => write!(f, "path-resolution"),
            ErrorKind::Copy => write!(f, "copy"),
            ErrorKind::Hash => write!(f, "hash"),
            ErrorKind::VerificationMismatch => write!(f, "verification-mismatch"),
        }
    }
}

/// A failure attached to one source entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    pub source: PathBuf,
    pub error_kind: ErrorKind,
    pub detail: String,
}

/// Why a raw Takeout path could not be mapped to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathResolutionError {
    #[error("path is empty after removing Takeout wrapper folders: {raw}")]
    Empty { raw: String },

    #[error("path contains a traversal or root segment: {raw}")]
    Traversal { raw: String },
}
