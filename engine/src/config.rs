//! Run configuration.
//!
//! Every recognised option is a field of [`RunConfig`]. Files are TOML and
//! unknown keys are rejected rather than ignored.

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::model::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory created next to the destination root for manifests and logs.
pub const DEFAULT_LOG_DIR_NAME: &str = "takeout_logs";

fn default_retry_count() -> u32 {
    2
}

fn default_progress_batch_size() -> usize {
    50
}

fn default_hash_workers() -> usize {
    4
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Options for one reconstruction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Extracted export roots; order decides canonical-member tie-breaks
    #[serde(default)]
    pub source_roots: Vec<PathBuf>,

    pub destination_root: PathBuf,

    /// Record intended outcomes without writing anything
    #[serde(default)]
    pub dry_run: bool,

    /// Re-hash copied files once copying finishes
    #[serde(default)]
    pub verify: bool,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Extra attempts after a failed copy
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Processed entries between two progress events
    #[serde(default = "default_progress_batch_size")]
    pub progress_batch_size: usize,

    #[serde(default)]
    pub hash_algorithm: ChecksumAlgorithm,

    /// Size of the hashing thread pool
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,

    /// Longest a hash or copy may go without reading or writing a chunk
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Leave Takeout's JSON metadata sidecars out of the rebuilt tree
    #[serde(default = "default_true")]
    pub skip_metadata_sidecars: bool,

    /// Where the manifest goes; defaults to `takeout_logs/` beside the destination
    #[serde(default)]
    pub manifest_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Configuration with defaults for everything but the paths.
    pub fn new<P: Into<PathBuf>>(source_roots: Vec<PathBuf>, destination_root: P) -> Self {
        RunConfig {
            source_roots,
            destination_root: destination_root.into(),
            dry_run: false,
            verify: false,
            duplicate_policy: DuplicatePolicy::default(),
            retry_count: default_retry_count(),
            progress_batch_size: default_progress_batch_size(),
            hash_algorithm: ChecksumAlgorithm::default(),
            hash_workers: default_hash_workers(),
            operation_timeout_secs: default_operation_timeout_secs(),
            skip_metadata_sidecars: true,
            manifest_dir: None,
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        toml::from_str(content).map_err(|e| EngineError::invalid_config(e.to_string()))
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no run could proceed with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.destination_root.as_os_str().is_empty() {
            return Err(EngineError::invalid_config("destination_root is empty"));
        }
        if self.progress_batch_size == 0 {
            return Err(EngineError::invalid_config(
                "progress_batch_size must be at least 1",
            ));
        }
        if self.hash_workers == 0 {
            return Err(EngineError::invalid_config("hash_workers must be at least 1"));
        }
        if self.operation_timeout_secs == 0 {
            return Err(EngineError::invalid_config(
                "operation_timeout_secs must be at least 1",
            ));
        }
        if let Some(root) = self
            .source_roots
            .iter()
            .find(|root| root.as_os_str().is_empty())
        {
            return Err(EngineError::invalid_config(format!(
                "empty source root: {:?}",
                root
            )));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Directory the manifest is written to.
    pub fn manifest_dir(&self) -> PathBuf {
        if let Some(dir) = &self.manifest_dir {
            return dir.clone();
        }
        match self.destination_root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(DEFAULT_LOG_DIR_NAME),
            _ => PathBuf::from(DEFAULT_LOG_DIR_NAME),
        }
    }
}

/// How rollback disposes of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalStrategy {
    /// Move to the system trash / recycle bin
    #[default]
    Trash,
    /// Unlink directly; nothing to recover afterwards
    Plain,
}
