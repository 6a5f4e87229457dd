//! The run manifest.
//!
//! A manifest is a JSON Lines file: one `run_started` header, one `entry`
//! record per processed source file in processing order, and a `finalized`
//! trailer written once the run reaches a terminal state. Every line is flushed
//! as it is written so a crash leaves a readable prefix; only a manifest with a
//! trailer is accepted for rollback.

use crate::checksums::{ChecksumAlgorithm, ChecksumValue};
use crate::error::{EngineError, ErrorKind};
use crate::model::{DuplicatePolicy, Outcome, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// First line of every manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub started_at: DateTime<Utc>,
    #[serde(with = "path_repr::list")]
    pub source_roots: Vec<PathBuf>,
    #[serde(with = "path_repr")]
    pub destination_root: PathBuf,
    pub dry_run: bool,
    pub duplicate_policy: DuplicatePolicy,
    pub hash_algorithm: ChecksumAlgorithm,
}

/// One planned or executed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Position in processing order, starting at 0
    pub sequence: u64,
    #[serde(with = "path_repr")]
    pub source: PathBuf,
    pub export_root: usize,
    /// Absent when the path could not be resolved
    #[serde(default, skip_serializing_if = "Option::is_none", with = "path_repr::option")]
    pub destination: Option<PathBuf>,
    pub size: u64,
    /// Absent when the source could not be hashed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ChecksumValue>,
    pub outcome: Outcome,
    /// Source of the canonical member when this entry duplicates another
    #[serde(default, skip_serializing_if = "Option::is_none", with = "path_repr::option")]
    pub duplicate_of: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Last line of a finalized manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTrailer {
    pub final_state: RunState,
    pub entries: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum ManifestRecord {
    RunStarted(ManifestHeader),
    Entry(ManifestEntry),
    Finalized(ManifestTrailer),
}

/// Append-only writer held by the engine for the duration of a run.
pub struct ManifestWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: u64,
}

impl ManifestWriter {
    /// Create `manifest_<timestamp>.jsonl` in `dir` and write the header.
    ///
    /// An existing manifest is never overwritten; a numeric suffix is added
    /// instead.
    pub fn create(dir: &Path, header: ManifestHeader) -> Result<Self, EngineError> {
        fs::create_dir_all(dir).map_err(|e| EngineError::ManifestWrite {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let stamp = header.started_at.format("%Y%m%d_%H%M%S").to_string();
        let mut counter = 0u32;
        let (path, file) = loop {
            let name = if counter == 0 {
                format!("manifest_{}.jsonl", stamp)
            } else {
                format!("manifest_{}_{}.jsonl", stamp, counter)
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
                Err(e) => return Err(EngineError::ManifestWrite { path, source: e }),
            }
        };

        let mut writer = ManifestWriter {
            path,
            writer: BufWriter::new(file),
            entries: 0,
        };
        writer.write_record(&ManifestRecord::RunStarted(header))?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended so far; also the next entry's sequence number.
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn append(&mut self, entry: ManifestEntry) -> Result<(), EngineError> {
        self.write_record(&ManifestRecord::Entry(entry))?;
        self.entries += 1;
        Ok(())
    }

    /// Write the trailer and sync the file. No writes are possible afterwards.
    pub fn finalize(
        mut self,
        final_state: RunState,
        finished_at: DateTime<Utc>,
    ) -> Result<PathBuf, EngineError> {
        let trailer = ManifestTrailer {
            final_state,
            entries: self.entries,
            finished_at,
        };
        self.write_record(&ManifestRecord::Finalized(trailer))?;
        let path = self.path.clone();
        let file = self
            .writer
            .into_inner()
            .map_err(|e| EngineError::ManifestWrite {
                path: path.clone(),
                source: e.into_error(),
            })?;
        file.sync_all().map_err(|e| EngineError::ManifestWrite {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    fn write_record(&mut self, record: &ManifestRecord) -> Result<(), EngineError> {
        let line = serde_json::to_string(record).map_err(|e| EngineError::ManifestWrite {
            path: self.path.clone(),
            source: e.into(),
        })?;
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| EngineError::ManifestWrite {
                path: self.path.clone(),
                source: e,
            })
    }
}

/// A manifest read back from disk.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub header: Option<ManifestHeader>,
    pub entries: Vec<ManifestEntry>,
    pub trailer: Option<ManifestTrailer>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::ManifestRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut manifest = Manifest {
            path: path.to_path_buf(),
            header: None,
            entries: Vec::new(),
            trailer: None,
        };

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| EngineError::ManifestRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ManifestRecord =
                serde_json::from_str(&line).map_err(|e| EngineError::ManifestParse {
                    path: path.to_path_buf(),
                    line: number + 1,
                    source: e,
                })?;
            match record {
                ManifestRecord::RunStarted(header) => manifest.header = Some(header),
                ManifestRecord::Entry(entry) => manifest.entries.push(entry),
                ManifestRecord::Finalized(trailer) => manifest.trailer = Some(trailer),
            }
        }

        Ok(manifest)
    }

    pub fn is_finalized(&self) -> bool {
        self.trailer.is_some()
    }

    pub fn destination_root(&self) -> Option<&Path> {
        self.header.as_ref().map(|h| h.destination_root.as_path())
    }

    /// Entries whose file was actually written, in manifest order.
    pub fn copied(&self) -> impl DoubleEndedIterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.outcome == Outcome::Copied)
    }
}

/// Serde form of paths in manifests and progress events.
///
/// A path that is valid Unicode is written as a plain string. Any other path
/// is written as `{"raw": "<hex>"}` holding the platform encoding (bytes on
/// Unix, UTF-16 units on Windows), so every path reads back unchanged.
pub(crate) mod path_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::ffi::{OsStr, OsString};
    use std::path::{Path, PathBuf};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw { raw: String },
    }

    fn to_repr(path: &Path) -> Repr {
        match path.to_str() {
            Some(text) => Repr::Text(text.to_string()),
            None => Repr::Raw {
                raw: encode(path.as_os_str()),
            },
        }
    }

    fn from_repr(repr: Repr) -> Result<PathBuf, String> {
        match repr {
            Repr::Text(text) => Ok(PathBuf::from(text)),
            Repr::Raw { raw } => decode(&raw).map(PathBuf::from),
        }
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        to_repr(path).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        from_repr(Repr::deserialize(deserializer)?).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: Serializer>(
            path: &Option<PathBuf>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match path {
                Some(path) => serializer.serialize_some(&to_repr(path)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<PathBuf>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(from_repr)
                .transpose()
                .map_err(D::Error::custom)
        }
    }

    pub mod list {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: Serializer>(paths: &[PathBuf], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(paths.iter().map(|p| to_repr(p)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<PathBuf>, D::Error> {
            Vec::<Repr>::deserialize(deserializer)?
                .into_iter()
                .map(from_repr)
                .collect::<Result<_, _>>()
                .map_err(D::Error::custom)
        }
    }

    fn hex_units(hex: &str, width: usize) -> Result<Vec<u16>, String> {
        if hex.len() % width != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid raw path encoding: {}", hex));
        }
        (0..hex.len())
            .step_by(width)
            .map(|i| u16::from_str_radix(&hex[i..i + width], 16).map_err(|e| e.to_string()))
            .collect()
    }

    #[cfg(unix)]
    fn encode(os: &OsStr) -> String {
        use std::os::unix::ffi::OsStrExt;
        os.as_bytes().iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[cfg(unix)]
    fn decode(hex: &str) -> Result<OsString, String> {
        use std::os::unix::ffi::OsStringExt;
        let bytes = hex_units(hex, 2)?.into_iter().map(|u| u as u8).collect();
        Ok(OsString::from_vec(bytes))
    }

    #[cfg(windows)]
    fn encode(os: &OsStr) -> String {
        use std::os::windows::ffi::OsStrExt;
        os.encode_wide().map(|u| format!("{:04x}", u)).collect()
    }

    #[cfg(windows)]
    fn decode(hex: &str) -> Result<OsString, String> {
        use std::os::windows::ffi::OsStringExt;
        Ok(OsString::from_wide(&hex_units(hex, 4)?))
    }

    #[cfg(not(any(unix, windows)))]
    fn encode(os: &OsStr) -> String {
        os.to_string_lossy()
            .bytes()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    #[cfg(not(any(unix, windows)))]
    fn decode(hex: &str) -> Result<OsString, String> {
        let bytes: Vec<u8> = hex_units(hex, 2)?.into_iter().map(|u| u as u8).collect();
        Ok(OsString::from(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn header(dest: &Path) -> ManifestHeader {
        ManifestHeader {
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            source_roots: vec![PathBuf::from("/exports/part1")],
            destination_root: dest.to_path_buf(),
            dry_run: false,
            duplicate_policy: DuplicatePolicy::Dedupe,
            hash_algorithm: ChecksumAlgorithm::Sha256,
        }
    }

    fn entry(sequence: u64, outcome: Outcome) -> ManifestEntry {
        ManifestEntry {
            sequence,
            source: PathBuf::from(format!("/exports/part1/f{}.txt", sequence)),
            export_root: 0,
            destination: Some(PathBuf::from(format!("/restore/f{}.txt", sequence))),
            size: 3,
            hash: Some(ChecksumValue::new(ChecksumAlgorithm::Sha256, "ab".to_string())),
            outcome,
            duplicate_of: None,
            error_kind: None,
            error: None,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 1).unwrap(),
        }
    }

    #[test]
    fn test_write_and_load() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut writer =
            ManifestWriter::create(temp_dir.path(), header(Path::new("/restore"))).expect("create");
        writer.append(entry(0, Outcome::Copied)).expect("append");
        writer.append(entry(1, Outcome::SkippedDuplicate)).expect("append");
        assert_eq!(writer.len(), 2);

        let finished = Utc.with_ymd_and_hms(2024, 5, 1, 12, 31, 0).unwrap();
        let path = writer.finalize(RunState::Completed, finished).expect("finalize");
        assert!(path
            .file_name()
            .expect("name")
            .to_string_lossy()
            .starts_with("manifest_20240501_123000"));

        let manifest = Manifest::load(&path).expect("load");
        assert!(manifest.is_finalized());
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.copied().count(), 1);
        assert_eq!(manifest.destination_root(), Some(Path::new("/restore")));
        assert_eq!(
            manifest.trailer.as_ref().map(|t| t.final_state),
            Some(RunState::Completed)
        );
    }

    #[test]
    fn test_one_record_per_line() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut writer =
            ManifestWriter::create(temp_dir.path(), header(Path::new("/restore"))).expect("create");
        writer.append(entry(0, Outcome::Copied)).expect("append");
        let path = writer
            .finalize(RunState::Completed, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap())
            .expect("finalize");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"record\":\"run_started\""));
        assert!(lines[1].contains("\"outcome\":\"copied\""));
        assert!(lines[1].contains("\"hash\":\"sha256:ab\""));
        assert!(!lines[1].contains("error_kind"));
        assert!(lines[2].contains("\"record\":\"finalized\""));
    }

    #[test]
    fn test_unfinalized_manifest_is_readable() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut writer =
            ManifestWriter::create(temp_dir.path(), header(Path::new("/restore"))).expect("create");
        writer.append(entry(0, Outcome::Copied)).expect("append");
        let path = writer.path().to_path_buf();
        drop(writer);

        let manifest = Manifest::load(&path).expect("load");
        assert!(!manifest.is_finalized());
        assert_eq!(manifest.entries.len(), 1);
    }

    #[test]
    fn test_existing_manifest_is_not_overwritten() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let first =
            ManifestWriter::create(temp_dir.path(), header(Path::new("/restore"))).expect("create");
        let second =
            ManifestWriter::create(temp_dir.path(), header(Path::new("/restore"))).expect("create");
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let writer =
            ManifestWriter::create(temp_dir.path(), header(Path::new("/restore"))).expect("create");
        let path = writer.path().to_path_buf();
        drop(writer);

        let mut content = fs::read_to_string(&path).expect("read");
        content.push_str("not json\n");
        fs::write(&path, content).expect("write");

        match Manifest::load(&path) {
            Err(EngineError::ManifestParse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other.map(|m| m.entries.len())),
        }
    }

    #[test]
    fn test_unicode_paths_stay_plain_strings() {
        let json = serde_json::to_string(&entry(0, Outcome::Copied)).expect("serialize");
        assert!(json.contains("\"source\":\"/exports/part1/f0.txt\""));
        assert!(!json.contains("\"raw\""));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_paths_round_trip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let odd = Path::new("/exports/part1").join(OsStr::from_bytes(b"caf\xe9.txt"));
        let mut record = entry(0, Outcome::Copied);
        record.source = odd.clone();
        record.destination = Some(Path::new("/restore").join(OsStr::from_bytes(b"caf\xe9.txt")));

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut header = header(Path::new("/restore"));
        header.source_roots.push(Path::new("/exports").join(OsStr::from_bytes(b"p\xff")));
        let mut writer = ManifestWriter::create(temp_dir.path(), header.clone()).expect("create");
        writer.append(record.clone()).expect("append");
        let path = writer
            .finalize(RunState::Completed, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap())
            .expect("finalize");

        let content = fs::read_to_string(&path).expect("manifest is valid UTF-8");
        assert!(content.contains("\"raw\":\"2f6578706f7274732f7061727431"));

        let manifest = Manifest::load(&path).expect("load");
        assert_eq!(manifest.header, Some(header));
        assert_eq!(manifest.entries, vec![record]);
        assert_eq!(manifest.entries[0].source, odd);
    }
}
