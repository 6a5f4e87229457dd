//! Content hashing and duplicate grouping.
//!
//! This module provides:
//! - Checksum algorithms (MD5, SHA-256, BLAKE3) behind one hasher trait
//! - Streamed file hashing with bounded memory and a per-operation deadline
//! - The run-scoped index that groups entries by identical content

use crate::error::EngineError;
use crate::stream::ChunkReader;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (fast, not collision resistant; matches Drive's md5Checksum field)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl ChecksumAlgorithm {
    /// Parse algorithm from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// A computed content digest.
///
/// Serialized as `"<algorithm>:<hex>"` so a manifest records which algorithm
/// produced each hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Get the hex string representation
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }

    /// Parse the "algo:hex" form written by `to_string_with_algo`.
    pub fn parse(s: &str) -> Option<Self> {
        let (algo, hex) = s.split_once(':')?;
        let algorithm = ChecksumAlgorithm::from_str(algo)?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(ChecksumValue::new(algorithm, hex.to_ascii_lowercase()))
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

impl Serialize for ChecksumValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_with_algo())
    }
}

impl<'de> Deserialize<'de> for ChecksumValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChecksumValue::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid checksum: {}", raw)))
    }
}

/// Trait for computing checksums
pub trait ChecksumHasher {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the checksum value
    fn finalize(self: Box<Self>) -> ChecksumValue;
}

/// MD5 hasher (backed by md5 crate)
struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute checksum for a file, reading it in 64 KiB chunks.
///
/// With `timeout` set the file is read on a helper thread and each chunk must
/// arrive within `timeout` of the previous one; a stalled read returns
/// `EngineError::Timeout`. Large files that keep making progress never time out.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    timeout: Option<Duration>,
) -> Result<ChecksumValue, EngineError> {
    let mut hasher = create_hasher(algorithm);

    if let Some(stall_limit) = timeout {
        let mut reader = ChunkReader::open(path, HASH_BUFFER_SIZE, stall_limit)?;
        while let Some(chunk) = reader.next_chunk()? {
            hasher.update(&chunk);
        }
        return Ok(hasher.finalize());
    }

    let mut file = File::open(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok(hasher.finalize())
}

/// Entries that share one content hash.
///
/// Members are indices into the run's stably ordered entry list, kept sorted,
/// so the canonical member is always the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub hash: ChecksumValue,
    members: Vec<usize>,
}

impl DuplicateGroup {
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn canonical(&self) -> usize {
        self.members[0]
    }

    pub fn is_duplicate(&self) -> bool {
        self.members.len() > 1
    }
}

/// Run-scoped hash -> DuplicateGroup index, owned by the engine.
#[derive(Debug, Default)]
pub struct DuplicateIndex {
    groups: BTreeMap<ChecksumValue, DuplicateGroup>,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `member` as having content `hash`.
    pub fn insert(&mut self, hash: ChecksumValue, member: usize) {
        let group = self
            .groups
            .entry(hash.clone())
            .or_insert_with(|| DuplicateGroup {
                hash,
                members: Vec::new(),
            });
        if let Err(pos) = group.members.binary_search(&member) {
            group.members.insert(pos, member);
        }
    }

    pub fn group(&self, hash: &ChecksumValue) -> Option<&DuplicateGroup> {
        self.groups.get(hash)
    }

    /// Canonical member for `hash`, if any entry has that content.
    pub fn canonical_for(&self, hash: &ChecksumValue) -> Option<usize> {
        self.groups.get(hash).map(DuplicateGroup::canonical)
    }

    /// Groups with more than one member, in hash order.
    pub fn duplicate_groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups.values().filter(|g| g.is_duplicate())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
