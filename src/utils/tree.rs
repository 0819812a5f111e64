/// Directory walking and copying for sandbox roots
use crate::config::types::Result;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Component, Path, PathBuf};

/// One regular file or symlink found under a root
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Path relative to the walked root, `/`-separated
    pub rel: String,
    pub path: PathBuf,
    /// For a symlink, the length of its target path
    pub size: u64,
    pub mtime_ns: i64,
    pub symlink: bool,
}

/// Relative path of `path` under `root` with `/` separators
pub fn rel_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Turn a `/`-separated relative path into a path under `root`, refusing
/// anything that would climb out of it
pub fn join_rel(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for part in rel.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => out.push(other),
        }
    }
    if out == root {
        None
    } else {
        Some(out)
    }
}

pub fn mtime_ns(meta: &fs::Metadata) -> i64 {
    meta.mtime().saturating_mul(1_000_000_000).saturating_add(meta.mtime_nsec())
}

/// Collect every regular file and symlink under `root`, sorted by relative
/// path. Symlinks are reported as entries and never followed.
pub fn walk_files(root: &Path) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                // Vanished between readdir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let file_type = meta.file_type();
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() || file_type.is_symlink() {
                if let Some(rel) = rel_string(root, &path) {
                    entries.push(TreeEntry {
                        rel,
                        size: meta.len(),
                        mtime_ns: mtime_ns(&meta),
                        symlink: file_type.is_symlink(),
                        path,
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(entries)
}

/// Content of one entry: a symlink's target path bytes, otherwise the file
pub fn read_entry(path: &Path) -> io::Result<Vec<u8>> {
    if fs::symlink_metadata(path)?.file_type().is_symlink() {
        Ok(fs::read_link(path)?.into_os_string().into_vec())
    } else {
        fs::read(path)
    }
}

/// Copy one entry to a fresh `dst`, recreating a symlink instead of copying
/// what it points at
pub fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::symlink_metadata(src)?.file_type().is_symlink() {
        symlink(fs::read_link(src)?, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Recursively copy `source` into `target`, recreating symlinks as links.
/// Returns the number of regular files copied.
pub fn copy_tree(source: &Path, target: &Path) -> Result<u64> {
    fs::create_dir_all(target)?;
    let mut copied = 0;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += copy_tree(&source_path, &target_path)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(&source_path)?;
            symlink(&link, &target_path)?;
        } else if file_type.is_file() {
            fs::copy(&source_path, &target_path)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Total bytes of regular files under `root`
pub fn tree_size(root: &Path) -> Result<u64> {
    Ok(walk_files(root)?
        .iter()
        .filter(|e| !e.symlink)
        .map(|e| e.size)
        .sum())
}
