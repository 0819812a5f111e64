//! Content-addressed blob store shared by every witness.
//!
//! Blobs are keyed by the digest of their uncompressed content, so two
//! witnesses that reference the same bytes share one stored copy no matter
//! which compression each asked for. A blob lives at `<hex>` or `<hex>.zst`.

use crate::config::types::{CelError, Result};
use crate::utils::hashing::{hash_bytes, Digest};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const ZSTD_SUFFIX: &str = ".zst";

/// Payload encoding of newly stored blobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Zstd,
    None,
}

/// Result of a store operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResult {
    pub digest: Digest,
    /// Uncompressed size in bytes
    pub size: u64,
    /// False when the content was already present
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    level: i32,
}

impl BlobStore {
    pub fn open(root: &Path, level: i32) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(BlobStore {
            root: root.to_path_buf(),
            level,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `content`, skipping the write if its digest is already present
    pub fn put(&self, content: &[u8], compression: Compression) -> Result<StoreResult> {
        let digest = hash_bytes(content);
        let size = content.len() as u64;
        if self.locate(&digest).is_some() {
            debug!("Blob {} already stored", digest);
            return Ok(StoreResult {
                digest,
                size,
                is_new: false,
            });
        }

        let (name, payload) = match compression {
            Compression::Zstd => (
                format!("{}{}", digest.to_hex(), ZSTD_SUFFIX),
                zstd::encode_all(content, self.level)?,
            ),
            Compression::None => (digest.to_hex(), content.to_vec()),
        };
        let final_path = self.root.join(&name);
        let tmp_path = self.root.join(format!(".{}.{}", name, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp_path, &payload)?;
        fs::rename(&tmp_path, &final_path)?;
        debug!("Stored blob {} ({} -> {} bytes)", digest, size, payload.len());

        Ok(StoreResult {
            digest,
            size,
            is_new: true,
        })
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.locate(digest).is_some()
    }

    /// Path of the stored blob in whichever encoding it has
    pub fn locate(&self, digest: &Digest) -> Option<PathBuf> {
        locate_in(&self.root, digest)
    }

    /// Uncompressed content of a blob, `None` if absent
    pub fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        match self.locate(digest) {
            Some(path) => read_blob(&path).map(Some),
            None => Ok(None),
        }
    }

    /// Place the stored blob into `dir`, hard-linking where the filesystem
    /// allows and copying otherwise
    pub fn link_into(&self, digest: &Digest, dir: &Path) -> Result<PathBuf> {
        let source = self
            .locate(digest)
            .ok_or_else(|| CelError::InvalidRequest(format!("blob {} is not stored", digest)))?;
        let name = source
            .file_name()
            .ok_or_else(|| CelError::InvalidRequest(format!("blob path {}", source.display())))?;
        fs::create_dir_all(dir)?;
        let target = dir.join(name);
        if target.exists() {
            return Ok(target);
        }
        if let Err(e) = fs::hard_link(&source, &target) {
            warn!("Hard link of {} failed ({}), copying instead", digest, e);
            fs::copy(&source, &target)?;
        }
        Ok(target)
    }
}

/// Find a blob for `digest` under `dir`
pub fn locate_in(dir: &Path, digest: &Digest) -> Option<PathBuf> {
    let hex = digest.to_hex();
    let plain = dir.join(&hex);
    if plain.is_file() {
        return Some(plain);
    }
    let compressed = dir.join(format!("{}{}", hex, ZSTD_SUFFIX));
    if compressed.is_file() {
        return Some(compressed);
    }
    None
}

/// Read a blob file, decompressing `.zst` payloads
pub fn read_blob(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path)?;
    let is_zstd = path
        .file_name()
        .map(|n| n.to_string_lossy().ends_with(ZSTD_SUFFIX))
        .unwrap_or(false);
    if !is_zstd {
        return Ok(raw);
    }
    zstd::decode_all(raw.as_slice()).map_err(|e| {
        CelError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("corrupt blob {}: {}", path.display(), e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_dedups_by_content() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), 3).unwrap();

        let first = store.put(b"same bytes", Compression::Zstd).unwrap();
        let second = store.put(b"same bytes", Compression::None).unwrap();
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.digest, second.digest);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_compressed_blob_reads_back_uncompressed() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), 3).unwrap();
        let content = b"abc".repeat(1000);
        let stored = store.put(&content, Compression::Zstd).unwrap();

        let path = store.locate(&stored.digest).unwrap();
        assert!(path.to_string_lossy().ends_with(".zst"));
        assert!(fs::metadata(&path).unwrap().len() < content.len() as u64);
        assert_eq!(store.get(&stored.digest).unwrap().unwrap(), content);
    }

    #[test]
    fn test_missing_blob_is_none() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), 3).unwrap();
        assert!(store.get(&hash_bytes(b"never stored")).unwrap().is_none());
    }

    #[test]
    fn test_link_into_places_blob() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(&dir.path().join("blobs"), 3).unwrap();
        let stored = store.put(b"payload", Compression::None).unwrap();

        let witness_blobs = dir.path().join("w/blobs");
        let linked = store.link_into(&stored.digest, &witness_blobs).unwrap();
        assert_eq!(fs::read(&linked).unwrap(), b"payload");
        // Second link is a no-op
        store.link_into(&stored.digest, &witness_blobs).unwrap();
        assert_eq!(locate_in(&witness_blobs, &stored.digest), Some(linked));
    }
}
