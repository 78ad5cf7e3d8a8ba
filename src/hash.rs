//! Hashing operations and types.
//!
//! Cache-entry file hashes are SHA-256: this crate has no content-addressed
//! artifact store, and the hashes here exist purely to detect whether a
//! file's bytes changed between validation passes.

use std::fmt;

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace};

use crate::fs;

/// A SHA-256 digest, serialized as lowercase hex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", hex::encode(self.0))]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a byte slice directly (used for config values and small buffers).
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(bytes.as_ref());
        Self(digest.into())
    }

    /// Render the digest as lowercase hex.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// The first 8 hex characters, used for content signatures.
    pub fn short(self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        let bytes = hex::decode(&hex).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("sha256 digest must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Hash the contents of the file at the specified path.
#[instrument(name = "hash_file")]
pub async fn hash_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<ContentHash> {
    let path = path.as_ref();
    let mut file = fs::open_file(path).await.context("open file")?;
    let mut hasher = Sha256::new();
    let mut data = vec![0; 64 * 1024];
    let mut bytes = 0;
    loop {
        let len = file.read(&mut data).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&data[..len]);
        bytes += len;
    }
    let hash = ContentHash(hasher.finalize().into());
    trace!(?path, %hash, ?bytes, "hash file");
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_is_stable_prefix() {
        let hash = ContentHash::of(b"hello world");
        assert_eq!(hash.short().len(), 8);
        assert!(hash.to_hex().starts_with(&hash.short()));
    }

    #[test]
    fn of_is_deterministic() {
        assert_eq!(ContentHash::of(b"abc"), ContentHash::of(b"abc"));
        assert_ne!(ContentHash::of(b"abc"), ContentHash::of(b"abd"));
    }
}
