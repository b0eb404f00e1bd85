use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use xxhash_rust::xxh64::Xxh64;

const CKSUM_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    XXHash,
    Sha256,
    None,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::XXHash => "xxhash",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::None => "none",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "xxhash" => Ok(ChecksumType::XXHash),
            "sha256" => Ok(ChecksumType::Sha256),
            "none" | "" => Ok(ChecksumType::None),
            other => Err(StoreError::InvalidParam(format!(
                "unknown checksum type: {}",
                other
            ))),
        }
    }
}

impl Default for ChecksumType {
    fn default() -> Self {
        ChecksumType::XXHash
    }
}

/// A checksum pair: algorithm tag plus hex-encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub ty: ChecksumType,
    pub value: String,
}

impl Checksum {
    pub fn new(ty: ChecksumType, value: impl Into<String>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }

    pub fn get(&self) -> (&str, &str) {
        (self.ty.as_str(), &self.value)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ty.as_str(), self.value)
    }
}

enum Hasher {
    Xx(Xxh64),
    Sha(Box<Sha256>),
}

impl Hasher {
    fn new(ty: ChecksumType) -> Option<Self> {
        match ty {
            ChecksumType::XXHash => Some(Hasher::Xx(Xxh64::new(0))),
            ChecksumType::Sha256 => Some(Hasher::Sha(Box::new(Sha256::new()))),
            ChecksumType::None => None,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Xx(h) => h.update(data),
            Hasher::Sha(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Hasher::Xx(h) => format!("{:016x}", h.digest()),
            Hasher::Sha(h) => hex::encode(h.finalize()),
        }
    }
}

pub fn bytes_checksum(ty: ChecksumType, data: &[u8]) -> Option<Checksum> {
    let mut hasher = Hasher::new(ty)?;
    hasher.update(data);
    Some(Checksum::new(ty, hasher.finish()))
}

/// Streaming digest of a whole file.
pub async fn file_checksum(path: impl AsRef<Path>, ty: ChecksumType) -> StoreResult<Option<Checksum>> {
    let mut hasher = match Hasher::new(ty) {
        Some(h) => h,
        None => return Ok(None),
    };
    let mut file = File::open(path.as_ref())
        .await
        .map_err(|e| StoreError::Io(format!("open {}: {}", path.as_ref().display(), e)))?;
    let mut buf = vec![0u8; CKSUM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(Checksum::new(ty, hasher.finish())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_checksum_stable() {
        let a = bytes_checksum(ChecksumType::XXHash, b"hello").unwrap();
        let b = bytes_checksum(ChecksumType::XXHash, b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ty, ChecksumType::XXHash);
        assert_eq!(a.value.len(), 16);

        let c = bytes_checksum(ChecksumType::Sha256, b"hello").unwrap();
        assert_eq!(c.value.len(), 64);
        assert!(bytes_checksum(ChecksumType::None, b"hello").is_none());
    }

    #[tokio::test]
    async fn test_file_checksum_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data = vec![7u8; 200_000];
        tokio::fs::write(&path, &data).await.unwrap();

        let from_file = file_checksum(&path, ChecksumType::XXHash)
            .await
            .unwrap()
            .unwrap();
        let from_bytes = bytes_checksum(ChecksumType::XXHash, &data).unwrap();
        assert_eq!(from_file, from_bytes);
    }
}
