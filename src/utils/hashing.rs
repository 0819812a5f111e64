//! Content digests.
//!
//! Every digest leaves this module algorithm-tagged (`blake3:<hex>`) so stored
//! artifacts stay self-describing.

use crate::config::types::{CelError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::str::FromStr;

pub const DIGEST_ALGORITHM: &str = "blake3";

/// BLAKE3 digest of some byte content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse either `blake3:<hex>` or bare hex
    pub fn parse(value: &str) -> Result<Self> {
        let hex = match value.split_once(':') {
            Some((algo, hex)) if algo == DIGEST_ALGORITHM => hex,
            Some((algo, _)) => {
                return Err(CelError::InvalidRequest(format!(
                    "unsupported digest algorithm: {}",
                    algo
                )))
            }
            None => value,
        };
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| CelError::InvalidRequest(format!("invalid digest {}: {}", value, e)))?;
        Ok(Self(*hash.as_bytes()))
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", DIGEST_ALGORITHM, self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Digest {
    type Err = CelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn hash_bytes(data: &[u8]) -> Digest {
    Digest::from(blake3::hash(data))
}

/// Stream a file through the hasher without loading it whole
pub fn hash_file(path: &Path) -> Result<Digest> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(Digest::from(hasher.finalize()))
}

/// Digest of a symlink's target path bytes. The link is never followed.
pub fn hash_link(path: &Path) -> Result<Digest> {
    let target = std::fs::read_link(path)?;
    Ok(hash_bytes(target.as_os_str().as_bytes()))
}
