//! # Takeout Rebuild Engine
//!
//! Headless engine that rebuilds a Google Drive folder tree from one or more
//! extracted Google Takeout exports. It is the foundation for the CLI and for
//! any other front end.
//!
//! ## Overview
//!
//! A run:
//! - walks every export root and merges the `Takeout*/Drive/` wrappers into
//!   one logical folder tree
//! - hashes every file on a bounded pool and groups identical content
//! - decides which `name(N).ext` suffixes are export artifacts and which mark
//!   distinct files
//! - copies in a stable order through a temporary file and an atomic rename
//! - appends each outcome to a JSON Lines manifest that later drives
//!   verification and rollback
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{run, RunConfig, RunContext};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::new(
//!     vec![PathBuf::from("/exports/takeout-001"), PathBuf::from("/exports/takeout-002")],
//!     "/restore/Drive",
//! );
//! let ctx = RunContext::new();
//! let result = run(&ctx, &config, None)?;
//!
//! println!("{}: {} copied", result.final_state, result.statistics.files_copied);
//! if let Some(manifest) = &result.manifest_location {
//!     println!("manifest: {}", manifest.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (SourceEntry, RunStatistics, RunResult, enums)
//! - **error**: Error types and handling
//! - **config**: Run configuration and its TOML form
//! - **context**: Caller-owned run context (latch, cancellation, clock)
//! - **fs_ops**: Enumeration and atomic copies
//! - **stream**: Chunked reads with a stall limit
//! - **checksums**: Streaming hashes and the duplicate index
//! - **resolver**: Takeout path to logical Drive path
//! - **manifest**: The JSON Lines run record
//! - **rebuild**: Run orchestration
//! - **verify**: Post-copy verification
//! - **rollback**: Undoing a run from its manifest
//! - **progress**: Progress reporting trait
//! - **worker**: Background runs

pub mod checksums;
pub mod config;
pub mod context;
pub mod error;
pub mod fs_ops;
pub mod manifest;
pub mod model;
pub mod progress;
pub mod rebuild;
pub mod resolver;
pub mod rollback;
mod stream;
pub mod verify;
pub mod worker;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue, DuplicateGroup};
pub use config::{RemovalStrategy, RunConfig};
pub use context::{Clock, FixedClock, RunContext, SystemClock};
pub use error::{EngineError, EntryError, ErrorKind, PathResolutionError};
pub use manifest::{Manifest, ManifestEntry};
pub use model::{
    DuplicatePolicy, Outcome, ResolvedPath, RunResult, RunState, RunStatistics, SourceEntry,
};
pub use progress::{ChannelReporter, EntrySummary, ProgressEvent, ProgressReporter};
pub use rebuild::run;
pub use resolver::PathResolver;
pub use rollback::{
    remover_for, rollback, PlainRemover, Remover, RollbackOptions, RollbackOutcome,
    RollbackReport, TrashRemover,
};
pub use verify::{verify, VerificationReport};
pub use worker::{spawn_run, RunHandle};
