/// Core types shared by the capsule engines
use crate::utils::hashing::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code reported when an execution is killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Sandbox strategy backing a capsule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Copy-on-write overlay above a read-only lower layer
    Overlay,
    /// Directory copy with mtime monitoring during execution
    Snapshot,
    /// Plain directory copy
    Portable,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Overlay => write!(f, "overlay"),
            SandboxKind::Snapshot => write!(f, "snapshot"),
            SandboxKind::Portable => write!(f, "portable"),
        }
    }
}

/// Capsule lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleState {
    Active,
    Deleted,
}

/// Persisted capsule metadata. The registry is the only writer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapsuleMetadata {
    pub capsule_id: String,
    /// Real directory promotions are applied to
    pub workspace: PathBuf,
    /// Lower layer the sandbox starts from (defaults to `workspace`)
    pub base: PathBuf,
    /// Sandbox root as seen by executed commands
    pub mount: PathBuf,
    /// Directory holding every on-disk artifact of this capsule
    pub capsule_dir: PathBuf,
    pub sandbox_kind: SandboxKind,
    /// Effective clock at creation (RFC 3339, offset applied)
    pub created_at: String,
    pub clock_offset_sec: i64,
    pub env_whitelist: Vec<String>,
    pub state: CapsuleState,
}

/// Kind of change applied to one path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Stable tag used when committing a change-set to a digest
    pub fn tag(self) -> u8 {
        match self {
            ChangeKind::Added => b'A',
            ChangeKind::Modified => b'M',
            ChangeKind::Deleted => b'D',
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// One affected path, relative to the sandbox root with `/` separators
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: String,
    /// Digest of the post-state, absent for deletions. For a symlink this
    /// covers the link's target path bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub size: u64,
    /// The post-state is a symlink to be recreated as a link
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub symlink: bool,
}

/// Path-ordered collection of change records, at most one per path
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    records: Vec<ChangeRecord>,
}

impl ChangeSet {
    /// Build a change-set, sorting by path. A later record for the same path
    /// replaces an earlier one.
    pub fn from_records<I: IntoIterator<Item = ChangeRecord>>(records: I) -> Self {
        let mut by_path: BTreeMap<String, ChangeRecord> = BTreeMap::new();
        for record in records {
            by_path.insert(record.path.clone(), record);
        }
        Self {
            records: by_path.into_values().collect(),
        }
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&ChangeRecord> {
        self.records
            .binary_search_by(|r| r.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.records[idx])
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangeRecord;
    type IntoIter = std::slice::Iter<'a, ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Resource usage of one execution (peak and cumulative, never averaged)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub rss_max_kb: u64,
    pub io_read_kb: u64,
    pub io_write_kb: u64,
}

/// Paths an execution touched, relative to the sandbox root
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchedPaths {
    pub read: Vec<String>,
    pub written: Vec<String>,
}

/// Outcome of one command run inside a capsule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub usage: ResourceUsage,
    pub touched: TouchedPaths,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Error type for capsule operations
#[derive(Error, Debug)]
pub enum CelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sandbox creation failed: {0}")]
    SandboxCreate(String),

    #[error("Capsule {0} not found")]
    CapsuleNotFound(String),

    #[error("Witness {0} not found")]
    WitnessNotFound(String),

    #[error("Witness {witness_id} failed integrity check: expected {expected}, recomputed {actual}")]
    WitnessIntegrity {
        witness_id: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Filesystem lock on {path} persisted after {attempts} attempts")]
    FilesystemLock { path: PathBuf, attempts: u32 },

    #[error("Promotion failed at {path}: {reason}")]
    PromotionPartialFailure { path: String, reason: String },

    #[error("Failure does not reproduce: {0}")]
    NotReproducible(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid pattern: {0}")]
    Pattern(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl CelError {
    /// Errors caused by transient OS contention that a bounded retry may clear
    pub fn is_transient(&self) -> bool {
        match self {
            CelError::Io(err) => crate::safety::cleanup::is_transient_io(err),
            CelError::FilesystemLock { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: ChangeKind, path: &str) -> ChangeRecord {
        ChangeRecord {
            kind,
            path: path.to_string(),
            digest: None,
            size: 0,
            symlink: false,
        }
    }

    #[test]
    fn test_change_set_orders_by_path() {
        let set = ChangeSet::from_records(vec![
            record(ChangeKind::Added, "src/b.rs"),
            record(ChangeKind::Deleted, "README"),
            record(ChangeKind::Modified, "src/a.rs"),
        ]);
        assert_eq!(set.paths(), vec!["README", "src/a.rs", "src/b.rs"]);
        assert_eq!(set.count(ChangeKind::Added), 1);
        assert_eq!(set.get("src/a.rs").map(|r| r.kind), Some(ChangeKind::Modified));
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn test_change_set_keeps_one_record_per_path() {
        let set = ChangeSet::from_records(vec![
            record(ChangeKind::Added, "x"),
            record(ChangeKind::Modified, "x"),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn test_change_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ChangeKind::Deleted).unwrap();
        assert_eq!(json, "\"deleted\"");
        assert_eq!(format!("{}", SandboxKind::Overlay), "overlay");
    }

    #[test]
    fn test_timeout_is_not_success() {
        let result = ExecutionResult {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            timed_out: true,
            duration_ms: 10,
            usage: ResourceUsage::default(),
            touched: TouchedPaths::default(),
        };
        assert!(!result.success());
    }
}
