//! Streaming checksum utilities for published files

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Bytes read per hasher update. Files are never loaded whole.
pub const DIGEST_CHUNK_SIZE: usize = 128 * 1024;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Prefix a hex digest with the algorithm tag, e.g. `sha256:ab12...`
    pub fn tag(self, hex_digest: &str) -> String {
        format!("{}:{}", self.as_str(), hex_digest)
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest and size of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hex: String,
    pub size_bytes: u64,
}

/// Compute the lowercase SHA-256 hex digest of everything `reader` yields
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<FileDigest> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(FileDigest {
        hex: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

/// Compute the SHA-256 digest of a file in fixed-size chunks
pub fn sha256_file(path: impl AsRef<Path>) -> Result<FileDigest> {
    let mut file = std::fs::File::open(path.as_ref())?;
    sha256_reader(&mut file)
}

/// Verify a file against an expected hex digest (with or without `sha256:` tag)
pub fn verify_file(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let expected = expected
        .strip_prefix("sha256:")
        .unwrap_or(expected)
        .to_ascii_lowercase();
    let actual = sha256_file(path)?.hex;

    if actual == expected {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            path: path.display().to_string(),
            expected,
            actual,
        })
    }
}
