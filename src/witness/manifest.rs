/// Witness manifest and root digest
use super::store::Compression;
use crate::config::types::{ChangeRecord, ResourceUsage};
use crate::utils::hashing::Digest;
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

const ROOT_DOMAIN: &[u8] = b"capsulebox.witness.root.v1\0";

/// Commitment over an ordered change-set. Each record contributes its path,
/// kind, content digest and whether that content is a link target; records
/// must already be sorted by path.
pub fn root_digest<'a, I>(records: I) -> Digest
where
    I: IntoIterator<Item = (&'a str, u8, Option<&'a Digest>, bool)>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(ROOT_DOMAIN);
    for (path, tag, digest, symlink) in records {
        hasher.update(&(path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update(&[tag]);
        match digest {
            Some(d) => {
                hasher.update(&[if symlink { 2 } else { 1 }]);
                hasher.update(d.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }
    hasher.finalize().into()
}

/// Root digest of a list of change records
pub fn root_of(records: &[ChangeRecord]) -> Digest {
    root_digest(
        records
            .iter()
            .map(|r| (r.path.as_str(), r.kind.tag(), r.digest.as_ref(), r.symlink)),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub capsule_id: String,
    pub created_at: String,
    pub root_digest: Digest,
    pub compression: Compression,
    /// Blobs were linked into the witness directory
    pub include_blobs: bool,
    pub records: Vec<ChangeRecord>,
    /// Usage of the capsule's last execution when the witness was taken
    pub usage: ResourceUsage,
}

impl Manifest {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ChangeKind;
    use crate::utils::hashing::hash_bytes;

    fn rec(kind: ChangeKind, path: &str, content: Option<&[u8]>) -> ChangeRecord {
        ChangeRecord {
            kind,
            path: path.to_string(),
            digest: content.map(hash_bytes),
            size: content.map(|c| c.len() as u64).unwrap_or(0),
            symlink: false,
        }
    }

    #[test]
    fn test_root_digest_depends_on_every_field() {
        let base = vec![rec(ChangeKind::Modified, "a", Some(b"x"))];
        let other_kind = vec![rec(ChangeKind::Added, "a", Some(b"x"))];
        let other_path = vec![rec(ChangeKind::Modified, "b", Some(b"x"))];
        let other_content = vec![rec(ChangeKind::Modified, "a", Some(b"y"))];
        let as_link = vec![ChangeRecord {
            symlink: true,
            ..rec(ChangeKind::Modified, "a", Some(b"x"))
        }];

        let root = root_of(&base);
        assert_ne!(root, root_of(&other_kind));
        assert_ne!(root, root_of(&other_path));
        assert_ne!(root, root_of(&other_content));
        assert_ne!(root, root_of(&as_link));
        assert_eq!(root, root_of(&base.clone()));
    }

    #[test]
    fn test_path_boundaries_are_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc"
        let left = vec![
            rec(ChangeKind::Deleted, "ab", None),
            rec(ChangeKind::Deleted, "c", None),
        ];
        let right = vec![
            rec(ChangeKind::Deleted, "a", None),
            rec(ChangeKind::Deleted, "bc", None),
        ];
        assert_ne!(root_of(&left), root_of(&right));
    }

    #[test]
    fn test_empty_change_set_has_stable_root() {
        assert_eq!(root_of(&[]), root_of(&[]));
    }
}
