//! Content digest of the staged object.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TransferError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithm applied to the staged content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Md5 => f.write_str("md5"),
            DigestAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(TransferError::Configuration(format!(
                "unknown digest algorithm: {other}"
            ))),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hex digest of an in-memory buffer.
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Streams the file at `path` once and returns its hex digest.
///
/// Any read failure is reported as [`TransferError::StagingRead`].
pub fn digest_file(algorithm: DigestAlgorithm, path: &Path) -> Result<String, TransferError> {
    hash_file(algorithm, path).map(|(digest, _)| digest)
}

/// Hex digest of the file at `path` and the number of bytes hashed.
pub(crate) fn hash_file(
    algorithm: DigestAlgorithm,
    path: &Path,
) -> Result<(String, u64), TransferError> {
    let staging_read = |e: std::io::Error| {
        TransferError::StagingRead(format!("{}: {e}", path.display()))
    };

    let mut file = std::fs::File::open(path).map_err(staging_read)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut hashed = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(staging_read)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        hashed += n as u64;
    }
    Ok((hasher.finalize_hex(), hashed))
}

/// Computes the digest of a staged file off the async runtime.
pub async fn compute_digest(
    algorithm: DigestAlgorithm,
    path: &Path,
) -> Result<String, TransferError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_file(algorithm, &path)).await?
}
