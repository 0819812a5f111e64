//! Change tracking for sandbox roots.
//!
//! A capsule's change-set is always computed against the pristine snapshot
//! taken at creation, never against the previous execution. Equality is
//! decided by content digest: matching size and mtime are not treated as
//! proof that a file is unchanged.

use crate::config::types::{ChangeKind, ChangeRecord, ChangeSet, Result};
use crate::utils::hashing::{hash_file, hash_link, Digest};
use crate::utils::tree::{mtime_ns, rel_string, walk_files};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

/// Recorded state of one regular file or symlink
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub size: u64,
    pub mtime_ns: i64,
    /// Content digest, or the digest of the target path for a symlink
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub symlink: bool,
}

impl FileState {
    /// Same post-state as far as promotion is concerned
    fn same_content(&self, other: &FileState) -> bool {
        self.digest == other.digest && self.symlink == other.symlink
    }

    fn record(&self, kind: ChangeKind, path: &str) -> ChangeRecord {
        ChangeRecord {
            kind,
            path: path.to_string(),
            digest: Some(self.digest),
            size: self.size,
            symlink: self.symlink,
        }
    }
}

fn deletion(path: String) -> ChangeRecord {
    ChangeRecord {
        kind: ChangeKind::Deleted,
        path,
        digest: None,
        size: 0,
        symlink: false,
    }
}

fn digest_of(path: &Path, symlink: bool) -> Result<Digest> {
    if symlink {
        hash_link(path)
    } else {
        hash_file(path)
    }
}

/// Path -> state for every regular file and symlink under a root
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub files: BTreeMap<String, FileState>,
}

impl TreeSnapshot {
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        for entry in walk_files(root)? {
            let digest = match digest_of(&entry.path, entry.symlink) {
                Ok(digest) => digest,
                // Deleted while we were walking
                Err(crate::config::types::CelError::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };
            files.insert(
                entry.rel,
                FileState {
                    size: entry.size,
                    mtime_ns: entry.mtime_ns,
                    digest,
                    symlink: entry.symlink,
                },
            );
        }
        Ok(Self { files })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, rel: &str) -> Option<&FileState> {
        self.files.get(rel)
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Every file strictly below directory `dir`
    pub fn under<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a String> + 'a {
        let prefix = format!("{}/", dir);
        self.files
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k)
    }
}

/// Content changes from `before` to `after`
pub fn diff_snapshots(before: &TreeSnapshot, after: &TreeSnapshot) -> ChangeSet {
    let mut records = Vec::new();
    for (path, state) in &after.files {
        match before.files.get(path) {
            None => records.push(state.record(ChangeKind::Added, path)),
            Some(old) if !old.same_content(state) => {
                records.push(state.record(ChangeKind::Modified, path))
            }
            Some(_) => {}
        }
    }
    for path in before.files.keys() {
        if !after.files.contains_key(path) {
            records.push(deletion(path.clone()));
        }
    }
    ChangeSet::from_records(records)
}

/// Paths written between two snapshots. A rewrite with identical content still
/// counts, which is why stat changes are included here but not in
/// [`diff_snapshots`].
pub fn written_between(before: &TreeSnapshot, after: &TreeSnapshot) -> BTreeSet<String> {
    let mut written = BTreeSet::new();
    for (path, state) in &after.files {
        if before.files.get(path) != Some(state) {
            written.insert(path.clone());
        }
    }
    for path in before.files.keys() {
        if !after.files.contains_key(path) {
            written.insert(path.clone());
        }
    }
    written
}

/// One entry found in an overlay upper layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpperEntry {
    File(FileState),
    /// Character device 0/0: the lower path was removed
    Whiteout,
    Dir { opaque: bool },
}

/// Scan an overlay upper directory
pub fn scan_upper(upper: &Path) -> Result<BTreeMap<String, UpperEntry>> {
    let mut entries = BTreeMap::new();
    let mut stack = vec![upper.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = match rel_string(upper, &path) {
                Some(rel) => rel,
                None => continue,
            };
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let file_type = meta.file_type();
            if file_type.is_dir() {
                entries.insert(
                    rel,
                    UpperEntry::Dir {
                        opaque: is_opaque_dir(&path),
                    },
                );
                stack.push(path);
            } else if file_type.is_char_device() && meta.rdev() == 0 {
                entries.insert(rel, UpperEntry::Whiteout);
            } else if file_type.is_file() || file_type.is_symlink() {
                entries.insert(
                    rel,
                    UpperEntry::File(FileState {
                        size: meta.len(),
                        mtime_ns: mtime_ns(&meta),
                        digest: digest_of(&path, file_type.is_symlink())?,
                        symlink: file_type.is_symlink(),
                    }),
                );
            }
        }
    }

    Ok(entries)
}

fn is_opaque_dir(path: &Path) -> bool {
    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let name = b"trusted.overlay.opaque\0";
    let mut value = [0u8; 4];
    let len = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            name.as_ptr() as *const libc::c_char,
            value.as_mut_ptr() as *mut libc::c_void,
            value.len(),
        )
    };
    len > 0 && value[0] == b'y'
}

/// Accumulated changes since capsule creation
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    pristine: TreeSnapshot,
}

impl ChangeTracker {
    pub fn new(pristine: TreeSnapshot) -> Self {
        Self { pristine }
    }

    pub fn pristine(&self) -> &TreeSnapshot {
        &self.pristine
    }

    /// Rescan a full sandbox root and diff it against the pristine snapshot
    pub fn changes_in(&self, root: &Path) -> Result<ChangeSet> {
        Ok(diff_snapshots(&self.pristine, &TreeSnapshot::capture(root)?))
    }

    /// Derive changes from an overlay upper layer alone. Rewrites that left
    /// content identical are dropped.
    pub fn changes_from_upper(&self, upper: &BTreeMap<String, UpperEntry>) -> ChangeSet {
        let mut records = Vec::new();
        let mut deleted = BTreeSet::new();

        for (rel, entry) in upper {
            match entry {
                UpperEntry::File(state) => {
                    match self.pristine.get(rel) {
                        None => records.push(state.record(ChangeKind::Added, rel)),
                        Some(old) if !old.same_content(state) => {
                            records.push(state.record(ChangeKind::Modified, rel))
                        }
                        Some(_) => {}
                    }
                    // A file now stands where a lower directory was
                    deleted.extend(self.pristine.under(rel).cloned());
                }
                UpperEntry::Whiteout => {
                    if self.pristine.get(rel).is_some() {
                        deleted.insert(rel.clone());
                    }
                    deleted.extend(self.pristine.under(rel).cloned());
                }
                UpperEntry::Dir { opaque } => {
                    if self.pristine.get(rel).is_some() {
                        deleted.insert(rel.clone());
                    }
                    if *opaque {
                        for lower in self.pristine.under(rel) {
                            if !matches!(upper.get(lower), Some(UpperEntry::File(_))) {
                                deleted.insert(lower.clone());
                            }
                        }
                    }
                }
            }
        }

        records.extend(deleted.into_iter().map(deletion));
        ChangeSet::from_records(records)
    }
}

/// Paths whose upper-layer entry appeared or changed between two scans
pub fn upper_written_between(
    before: &BTreeMap<String, UpperEntry>,
    after: &BTreeMap<String, UpperEntry>,
) -> BTreeSet<String> {
    let mut written = BTreeSet::new();
    for (rel, entry) in after {
        if matches!(entry, UpperEntry::Dir { .. }) {
            continue;
        }
        if before.get(rel) != Some(entry) {
            written.insert(rel.clone());
        }
    }
    for (rel, entry) in before {
        if !matches!(entry, UpperEntry::Dir { .. }) && !after.contains_key(rel) {
            written.insert(rel.clone());
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hashing::hash_bytes;
    use tempfile::TempDir;

    fn state(content: &[u8]) -> FileState {
        FileState {
            size: content.len() as u64,
            mtime_ns: 1,
            digest: hash_bytes(content),
            symlink: false,
        }
    }

    #[test]
    fn test_diff_detects_all_kinds() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep"), "same").unwrap();
        fs::write(dir.path().join("edit"), "before").unwrap();
        fs::write(dir.path().join("drop"), "gone soon").unwrap();
        let tracker = ChangeTracker::new(TreeSnapshot::capture(dir.path()).unwrap());

        fs::write(dir.path().join("edit"), "after").unwrap();
        fs::remove_file(dir.path().join("drop")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/new"), "fresh").unwrap();

        let changes = tracker.changes_in(dir.path()).unwrap();
        let summary: Vec<_> = changes.iter().map(|r| (r.path.as_str(), r.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("drop", ChangeKind::Deleted),
                ("edit", ChangeKind::Modified),
                ("sub/new", ChangeKind::Added),
            ]
        );
        assert_eq!(changes.get("sub/new").unwrap().digest, Some(hash_bytes(b"fresh")));
    }

    #[test]
    fn test_identical_rewrite_is_written_but_not_changed() {
        let mut before = TreeSnapshot::default();
        before.files.insert("a".into(), state(b"x"));
        let mut after = before.clone();
        after.files.get_mut("a").unwrap().mtime_ns = 99;

        assert!(diff_snapshots(&before, &after).is_empty());
        assert_eq!(written_between(&before, &after).len(), 1);
    }

    #[test]
    fn test_same_stat_different_content_is_modified() {
        let mut before = TreeSnapshot::default();
        before.files.insert("a".into(), state(b"one"));
        let mut after = TreeSnapshot::default();
        after.files.insert("a".into(), state(b"two"));
        let changes = diff_snapshots(&before, &after);
        assert_eq!(changes.records()[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn test_changes_from_upper_handles_whiteouts_and_opaque_dirs() {
        let mut pristine = TreeSnapshot::default();
        pristine.files.insert("keep.txt".into(), state(b"k"));
        pristine.files.insert("same.txt".into(), state(b"s"));
        pristine.files.insert("gone.txt".into(), state(b"g"));
        pristine.files.insert("dir/a".into(), state(b"a"));
        pristine.files.insert("dir/b".into(), state(b"b"));
        let tracker = ChangeTracker::new(pristine);

        let mut upper = BTreeMap::new();
        upper.insert("same.txt".to_string(), UpperEntry::File(state(b"s")));
        upper.insert("keep.txt".to_string(), UpperEntry::File(state(b"k2")));
        upper.insert("gone.txt".to_string(), UpperEntry::Whiteout);
        upper.insert("dir".to_string(), UpperEntry::Dir { opaque: true });
        upper.insert("dir/b".to_string(), UpperEntry::File(state(b"b")));
        upper.insert("new.txt".to_string(), UpperEntry::File(state(b"n")));

        let changes = tracker.changes_from_upper(&upper);
        let summary: Vec<_> = changes.iter().map(|r| (r.path.as_str(), r.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("dir/a", ChangeKind::Deleted),
                ("gone.txt", ChangeKind::Deleted),
                ("keep.txt", ChangeKind::Modified),
                ("new.txt", ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), "data").unwrap();
        let snapshot = TreeSnapshot::capture(dir.path()).unwrap();
        let file = dir.path().join("pristine.json");
        snapshot.save(&file).unwrap();
        assert_eq!(TreeSnapshot::load(&file).unwrap(), snapshot);
    }

    #[test]
    fn test_symlink_changes_are_tracked() {
        use std::os::unix::fs::symlink;
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("test.txt"), "t").unwrap();
        symlink("test.txt", dir.path().join("retarget")).unwrap();
        symlink("test.txt", dir.path().join("doomed")).unwrap();
        let tracker = ChangeTracker::new(TreeSnapshot::capture(dir.path()).unwrap());
        assert!(tracker.pristine().get("retarget").unwrap().symlink);

        symlink("test.txt", dir.path().join("link")).unwrap();
        fs::remove_file(dir.path().join("retarget")).unwrap();
        symlink("elsewhere", dir.path().join("retarget")).unwrap();
        fs::remove_file(dir.path().join("doomed")).unwrap();

        let changes = tracker.changes_in(dir.path()).unwrap();
        let summary: Vec<_> = changes
            .iter()
            .map(|r| (r.path.as_str(), r.kind, r.symlink))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("doomed", ChangeKind::Deleted, false),
                ("link", ChangeKind::Added, true),
                ("retarget", ChangeKind::Modified, true),
            ]
        );
        assert_eq!(changes.get("link").unwrap().digest, Some(hash_bytes(b"test.txt")));
    }

    #[test]
    fn test_file_replaced_by_link_with_same_bytes_is_modified() {
        let mut before = TreeSnapshot::default();
        before.files.insert("a".into(), state(b"target"));
        let mut after = TreeSnapshot::default();
        after.files.insert(
            "a".into(),
            FileState {
                symlink: true,
                ..state(b"target")
            },
        );
        let changes = diff_snapshots(&before, &after);
        assert_eq!(changes.records()[0].kind, ChangeKind::Modified);
        assert!(changes.records()[0].symlink);
    }

    #[test]
    fn test_scan_upper_records_symlinks() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("test.txt", dir.path().join("link")).unwrap();
        let upper = scan_upper(dir.path()).unwrap();
        match upper.get("link") {
            Some(UpperEntry::File(state)) => {
                assert!(state.symlink);
                assert_eq!(state.digest, hash_bytes(b"test.txt"));
            }
            other => panic!("unexpected entry {:?}", other),
        }
        let changes = ChangeTracker::new(TreeSnapshot::default()).changes_from_upper(&upper);
        assert!(changes.get("link").unwrap().symlink);
    }

    #[test]
    fn test_under_lists_descendants_only() {
        let mut snap = TreeSnapshot::default();
        snap.files.insert("a/x".into(), state(b"1"));
        snap.files.insert("a/y/z".into(), state(b"2"));
        snap.files.insert("ab".into(), state(b"3"));
        let under: Vec<_> = snap.under("a").cloned().collect();
        assert_eq!(under, vec!["a/x", "a/y/z"]);
    }
}
