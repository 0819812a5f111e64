//! Witness packaging and replay.
//!
//! A witness is a manifest of change records plus the content they point
//! to. Its identifier is the tagged digest of the manifest bytes, and its
//! root digest commits to the ordered `(path, kind, content digest)` tuples.
//! Replay recomputes both from what is on disk and never touches a
//! workspace.

pub mod manifest;
pub mod store;

use crate::config::types::{CelError, ChangeKind, ChangeRecord, ChangeSet, ResourceUsage, Result};
use crate::utils::hashing::{hash_bytes, Digest};
use crate::utils::tree::{join_rel, read_entry, tree_size};
use log::{debug, info, warn};
use manifest::{root_of, Manifest, MANIFEST_FILE, MANIFEST_VERSION};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use store::{locate_in, read_blob, BlobStore};

pub use store::Compression;

const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WitnessOptions {
    pub compress: Compression,
    pub include_blobs: bool,
}

/// What `create` hands back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessInfo {
    /// `blake3:<hex>` digest of the manifest
    pub witness_id: String,
    pub path: PathBuf,
    pub root_digest: Digest,
    pub size_bytes: u64,
    /// Blobs written by this call rather than deduplicated
    pub blobs_new: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMetrics {
    pub blobs_verified: usize,
    pub bytes: u64,
    /// Paths whose stored content no longer matches its recorded digest
    pub mismatches: Vec<String>,
    pub duration_ms: u64,
    /// Usage recorded when the witness was taken
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replay_ok: bool,
    /// Root digest recomputed from stored content
    pub root_digest: Digest,
    pub expected_root: Digest,
    pub metrics: ReplayMetrics,
    pub change_set: ChangeSet,
}

#[derive(Debug, Clone)]
pub struct WitnessEngine {
    witnesses_dir: PathBuf,
    store: BlobStore,
}

impl WitnessEngine {
    pub fn new(witnesses_dir: &Path, blobs_dir: &Path, compress_level: i32) -> Result<Self> {
        fs::create_dir_all(witnesses_dir)?;
        Ok(WitnessEngine {
            witnesses_dir: witnesses_dir.to_path_buf(),
            store: BlobStore::open(blobs_dir, compress_level)?,
        })
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Package `changes` as found under `mount`. Content is read and hashed
    /// again here, so the witness reflects the bytes actually stored.
    pub fn create(
        &self,
        capsule_id: &str,
        created_at: &str,
        mount: &Path,
        changes: &ChangeSet,
        options: WitnessOptions,
        usage: ResourceUsage,
    ) -> Result<WitnessInfo> {
        let mut records = Vec::with_capacity(changes.len());
        let mut blobs_new = 0;

        for record in changes {
            if record.kind == ChangeKind::Deleted {
                records.push(record.clone());
                continue;
            }
            let path = join_rel(mount, &record.path).ok_or_else(|| {
                CelError::InvalidRequest(format!("change path escapes the capsule: {}", record.path))
            })?;
            let content = read_entry(&path)?;
            let stored = self.store.put(&content, options.compress)?;
            if stored.is_new {
                blobs_new += 1;
            }
            if record.digest.as_ref() != Some(&stored.digest) {
                debug!("{} changed since the change-set was computed", record.path);
            }
            records.push(ChangeRecord {
                kind: record.kind,
                path: record.path.clone(),
                digest: Some(stored.digest),
                size: stored.size,
                symlink: record.symlink,
            });
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            capsule_id: capsule_id.to_string(),
            created_at: created_at.to_string(),
            root_digest: root_of(&records),
            compression: options.compress,
            include_blobs: options.include_blobs,
            records,
            usage,
        };
        let bytes = manifest.to_bytes()?;
        let id = hash_bytes(&bytes);
        let dir = self.witnesses_dir.join(id.to_hex());
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;

        if options.include_blobs {
            let blobs = dir.join(BLOBS_DIR);
            for digest in manifest.records.iter().filter_map(|r| r.digest.as_ref()) {
                self.store.link_into(digest, &blobs)?;
            }
        }

        let info = WitnessInfo {
            witness_id: id.to_string(),
            path: dir.clone(),
            root_digest: manifest.root_digest,
            size_bytes: tree_size(&dir)?,
            blobs_new,
        };
        info!(
            "Witness {} for capsule {}: {} records, root {}",
            info.witness_id,
            capsule_id,
            manifest.records.len(),
            info.root_digest
        );
        Ok(info)
    }

    fn witness_dir(&self, witness_id: &str) -> Result<(Digest, PathBuf)> {
        let id = Digest::parse(witness_id)
            .map_err(|_| CelError::WitnessNotFound(witness_id.to_string()))?;
        let dir = self.witnesses_dir.join(id.to_hex());
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(CelError::WitnessNotFound(witness_id.to_string()));
        }
        Ok((id, dir))
    }

    pub fn load_manifest(&self, witness_id: &str) -> Result<Manifest> {
        let (_, dir) = self.witness_dir(witness_id)?;
        Ok(Manifest::from_bytes(&fs::read(dir.join(MANIFEST_FILE))?)?)
    }

    /// Recompute the root digest from stored content. A mismatch is reported
    /// in the result, never raised.
    pub fn replay(&self, witness_id: &str) -> Result<ReplayReport> {
        let started = Instant::now();
        let (id, dir) = self.witness_dir(witness_id)?;
        let bytes = fs::read(dir.join(MANIFEST_FILE))?;
        let manifest_intact = hash_bytes(&bytes) == id;
        if !manifest_intact {
            warn!("Manifest of witness {} does not match its id", witness_id);
        }
        let manifest = Manifest::from_bytes(&bytes)?;

        let mut metrics = ReplayMetrics {
            usage: manifest.usage,
            ..Default::default()
        };
        let local_blobs = dir.join(BLOBS_DIR);
        let mut recomputed = Vec::with_capacity(manifest.records.len());

        for record in &manifest.records {
            let digest = match &record.digest {
                Some(expected) => {
                    let content = self.read_content(&local_blobs, expected)?;
                    let actual = content.as_deref().map(hash_bytes);
                    if let Some(content) = &content {
                        metrics.bytes += content.len() as u64;
                        metrics.blobs_verified += 1;
                    }
                    if actual.as_ref() != Some(expected) {
                        metrics.mismatches.push(record.path.clone());
                    }
                    actual
                }
                None => None,
            };
            recomputed.push(ChangeRecord {
                kind: record.kind,
                path: record.path.clone(),
                digest,
                size: record.size,
                symlink: record.symlink,
            });
        }

        let root = root_of(&recomputed);
        let replay_ok = manifest_intact && root == manifest.root_digest;
        metrics.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Replayed witness {}: ok={} ({} blobs, {} mismatches)",
            witness_id,
            replay_ok,
            metrics.blobs_verified,
            metrics.mismatches.len()
        );

        Ok(ReplayReport {
            replay_ok,
            root_digest: root,
            expected_root: manifest.root_digest,
            metrics,
            change_set: ChangeSet::from_records(manifest.records),
        })
    }

    /// Replay and turn a mismatch into [`CelError::WitnessIntegrity`]
    pub fn verify(&self, witness_id: &str) -> Result<ReplayReport> {
        let report = self.replay(witness_id)?;
        if !report.replay_ok {
            return Err(CelError::WitnessIntegrity {
                witness_id: witness_id.to_string(),
                expected: report.expected_root.to_string(),
                actual: report.root_digest.to_string(),
            });
        }
        Ok(report)
    }

    /// Content for `digest`, preferring blobs linked into the witness
    fn read_content(&self, local_blobs: &Path, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = locate_in(local_blobs, digest).or_else(|| self.store.locate(digest));
        match path {
            Some(path) => match read_blob(&path) {
                Ok(content) => Ok(Some(content)),
                Err(CelError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("Blob {} is unreadable: {}", path.display(), e);
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }
}
