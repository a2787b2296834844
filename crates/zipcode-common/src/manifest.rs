//! Digest manifest published next to the data package
//!
//! The manifest records the size and SHA-256 digest of every published file
//! so downstream consumers can verify what they fetched:
//!
//! ```json
//! {
//!   "algorithm": "sha256",
//!   "generated_at": "2024-05-01T03:00:00Z",
//!   "date": "2024-05-01",
//!   "files": {
//!     "ken_all_oogaki.csv": { "size_bytes": 18234567, "hash": "sha256:..." }
//!   }
//! }
//! ```

use crate::checksum::{sha256_file, ChecksumAlgorithm, FileDigest};
use crate::error::{CommonError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size_bytes: u64,
    /// Tagged digest, `sha256:<hex>`
    pub hash: String,
}

impl ManifestEntry {
    pub fn from_digest(algorithm: ChecksumAlgorithm, digest: &FileDigest) -> Self {
        Self {
            size_bytes: digest.size_bytes,
            hash: algorithm.tag(&digest.hex),
        }
    }

    /// Hex digest without the algorithm tag
    pub fn hex(&self) -> &str {
        self.hash
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestManifest {
    pub algorithm: ChecksumAlgorithm,
    pub generated_at: DateTime<Utc>,
    /// Publication date, `YYYY-MM-DD`
    pub date: String,
    pub files: BTreeMap<String, ManifestEntry>,
}

/// Outcome of checking one entry against the file system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Ok,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    DigestMismatch { expected: String, actual: String },
}

impl DigestManifest {
    pub fn new(generated_at: DateTime<Utc>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            generated_at,
            date: generated_at.format("%Y-%m-%d").to_string(),
            files: BTreeMap::new(),
        }
    }

    /// Add an entry. Returns an error if the name is already present.
    pub fn insert(&mut self, name: impl Into<String>, digest: &FileDigest) -> Result<()> {
        let name = name.into();
        if self.files.contains_key(&name) {
            return Err(CommonError::InvalidManifest(format!(
                "duplicate entry '{}'",
                name
            )));
        }
        let entry = ManifestEntry::from_digest(self.algorithm, digest);
        self.files.insert(name, entry);
        Ok(())
    }

    /// Hash `path` and record it under `name`
    pub fn add_file(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        let digest = sha256_file(path)?;
        self.insert(name, &digest)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the manifest, replacing any previous one at `path`.
    ///
    /// The document goes to a sibling temp file first and is renamed into
    /// place, so readers never observe a half-written manifest.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;

        if path.exists() {
            warn!(path = %path.display(), "Overwriting existing digest manifest");
        }

        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            std::fs::rename(&tmp, path)
        };

        write().map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            CommonError::ManifestWrite {
                path: path.to_path_buf(),
                source,
            }
        })?;

        debug!(path = %path.display(), entries = self.files.len(), "Wrote digest manifest");
        Ok(())
    }

    /// Check every entry against files under `dir`
    pub fn verify(&self, dir: impl AsRef<Path>) -> Result<BTreeMap<String, EntryStatus>> {
        let dir = dir.as_ref();
        self.verify_with(|name| dir.join(name))
    }

    /// Check every entry against the file `locate` maps its name to
    pub fn verify_with<F>(&self, locate: F) -> Result<BTreeMap<String, EntryStatus>>
    where
        F: Fn(&str) -> PathBuf,
    {
        let mut report = BTreeMap::new();

        for (name, entry) in &self.files {
            let path = locate(name);
            let status = if !path.is_file() {
                EntryStatus::Missing
            } else {
                let digest = sha256_file(&path)?;
                if digest.size_bytes != entry.size_bytes {
                    EntryStatus::SizeMismatch {
                        expected: entry.size_bytes,
                        actual: digest.size_bytes,
                    }
                } else if !digest.hex.eq_ignore_ascii_case(entry.hex()) {
                    EntryStatus::DigestMismatch {
                        expected: entry.hex().to_string(),
                        actual: digest.hex,
                    }
                } else {
                    EntryStatus::Ok
                }
            };
            report.insert(name.clone(), status);
        }

        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_manifest_shape() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("b.csv"), [b'b'; 20]).unwrap();

        let mut manifest = DigestManifest::new(fixed_time());
        manifest.add_file("a.csv", dir.path().join("a.csv")).unwrap();
        manifest.add_file("b.csv", dir.path().join("b.csv")).unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.date, "2024-05-01");
        assert_eq!(manifest.files["a.csv"].size_bytes, 10);
        assert_eq!(manifest.files["b.csv"].size_bytes, 20);
        for entry in manifest.files.values() {
            assert!(entry.hash.starts_with("sha256:"));
            assert_eq!(entry.hex().len(), 64);
            assert!(entry.hex().chars().all(|c| c.is_ascii_hexdigit()));
        }

        let json: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["algorithm"], "sha256");
        assert_eq!(json["files"]["a.csv"]["size_bytes"], 10);
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let digest = FileDigest {
            hex: "00".repeat(32),
            size_bytes: 1,
        };
        let mut manifest = DigestManifest::new(fixed_time());
        manifest.insert("a.csv", &digest).unwrap();
        assert!(matches!(
            manifest.insert("a.csv", &digest),
            Err(CommonError::InvalidManifest(_))
        ));
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_write_overwrites_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("digest.json");
        std::fs::write(&path, b"stale").unwrap();

        let mut manifest = DigestManifest::new(fixed_time());
        manifest
            .insert("x.csv", &FileDigest { hex: "ab".repeat(32), size_bytes: 3 })
            .unwrap();
        manifest.write_to(&path).unwrap();

        let loaded = DigestManifest::from_path(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(!dir.path().join("digest.json.tmp").exists());
    }

    #[test]
    fn test_write_to_unwritable_location() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let manifest = DigestManifest::new(fixed_time());
        let err = manifest.write_to(blocker.join("digest.json")).unwrap_err();
        assert!(matches!(err, CommonError::ManifestWrite { .. }));
    }

    #[test]
    fn test_verify_reports_each_status() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("good.csv"), b"good").unwrap();
        std::fs::write(dir.path().join("bad.csv"), b"bad!").unwrap();
        std::fs::write(dir.path().join("short.csv"), b"s").unwrap();

        let mut manifest = DigestManifest::new(fixed_time());
        manifest.add_file("good.csv", dir.path().join("good.csv")).unwrap();
        manifest.add_file("bad.csv", dir.path().join("bad.csv")).unwrap();
        manifest.add_file("short.csv", dir.path().join("short.csv")).unwrap();
        manifest
            .insert("gone.csv", &FileDigest { hex: "00".repeat(32), size_bytes: 0 })
            .unwrap();

        std::fs::write(dir.path().join("bad.csv"), b"BAD!").unwrap();
        std::fs::write(dir.path().join("short.csv"), b"longer").unwrap();

        let report = manifest.verify(dir.path()).unwrap();
        assert_eq!(report["good.csv"], EntryStatus::Ok);
        assert!(matches!(report["bad.csv"], EntryStatus::DigestMismatch { .. }));
        assert_eq!(
            report["short.csv"],
            EntryStatus::SizeMismatch { expected: 1, actual: 6 }
        );
        assert_eq!(report["gone.csv"], EntryStatus::Missing);
    }

    #[test]
    fn test_verify_with_nested_layout() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/a.csv"), b"a,b\n").unwrap();

        let mut manifest = DigestManifest::new(fixed_time());
        manifest.add_file("a.csv", dir.path().join("data/a.csv")).unwrap();

        assert_eq!(manifest.verify(dir.path()).unwrap()["a.csv"], EntryStatus::Missing);
        let report = manifest
            .verify_with(|name| dir.path().join("data").join(name))
            .unwrap();
        assert_eq!(report["a.csv"], EntryStatus::Ok);
    }
}
