//! Archive unpacker
//!
//! Pulls the single payload file out of a downloaded zip. The payload is
//! the one entry whose name ends in the configured suffix, compared
//! case-insensitively (`KEN_ALL.CSV` and `ken_all.csv` both match). An
//! archive with several candidates is rejected instead of guessing.

use crate::error::{Result, SyncError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

/// Default payload suffix
pub const DEFAULT_PAYLOAD_SUFFIX: &str = ".csv";

#[derive(Debug, Clone)]
pub struct ArchiveUnpacker {
    suffix: String,
}

impl Default for ArchiveUnpacker {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_SUFFIX)
    }
}

impl ArchiveUnpacker {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into().to_lowercase(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Extract the payload of `archive` into `target_dir` and return its path
    pub fn unpack(&self, archive: &Path, target_dir: &Path) -> Result<PathBuf> {
        let mut zip = ZipArchive::new(File::open(archive)?)?;

        let mut candidates = self.candidates(&mut zip)?;
        if candidates.len() > 1 {
            return Err(SyncError::AmbiguousPayload {
                archive: archive.to_path_buf(),
                candidates: candidates.into_iter().map(|(_, name)| name).collect(),
            });
        }
        let Some((index, name)) = candidates.pop() else {
            return Err(SyncError::PayloadNotFound {
                archive: archive.to_path_buf(),
                suffix: self.suffix.clone(),
            });
        };

        let mut entry = zip.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("payload entry '{}' escapes the extraction directory", name),
            )
        })?;
        let output = target_dir.join(relative);

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(&output)?);
        let bytes = std::io::copy(&mut entry, &mut writer)?;
        writer.flush()?;

        info!(
            archive = %archive.display(),
            entry = %name,
            bytes,
            path = %output.display(),
            "Extracted payload"
        );
        Ok(output)
    }

    fn candidates(&self, zip: &mut ZipArchive<File>) -> Result<Vec<(usize, String)>> {
        let mut found = Vec::new();
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if name.to_lowercase().ends_with(&self.suffix) {
                debug!(entry = %name, "Payload candidate");
                found.push((index, name));
            }
        }
        Ok(found)
    }
}
