//! Error types for resource synchronization

use std::path::PathBuf;
use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error types for fetching, converting and publishing resources
///
/// Errors up to and including `Encoding` are confined to the resource that
/// raised them. Everything that happens after all resources have been joined
/// (digests, manifest, package, publishing) aborts the run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transfer from {url} failed: {reason}")]
    Transfer { url: String, reason: String },

    #[error("No entry ending in '{suffix}' found in {}", archive.display())]
    PayloadNotFound { archive: PathBuf, suffix: String },

    #[error("{} contains {} entries ending in the payload suffix: {}", archive.display(), candidates.len(), candidates.join(", "))]
    AmbiguousPayload {
        archive: PathBuf,
        candidates: Vec<String>,
    },

    #[error("Invalid {encoding} byte sequence at line {line} of {}", path.display())]
    Encoding {
        path: PathBuf,
        line: u64,
        encoding: &'static str,
    },

    #[error("Resource '{name}' is not described in the catalog")]
    CatalogMismatch { name: String },

    #[error("Manifest write failed: {0}")]
    ManifestWrite(#[from] zipcode_common::CommonError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("No resource synchronized successfully ({failed} failed)")]
    NoResourceSucceeded { failed: usize },

    #[error("Run cancelled before publishing")]
    Cancelled,
}

impl SyncError {
    pub fn transfer(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SyncError::Transfer {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly name, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transfer { .. } => "transfer",
            SyncError::PayloadNotFound { .. } => "payload_not_found",
            SyncError::AmbiguousPayload { .. } => "ambiguous_payload",
            SyncError::Encoding { .. } => "encoding",
            SyncError::CatalogMismatch { .. } => "catalog_mismatch",
            SyncError::ManifestWrite(_) => "manifest_write",
            SyncError::Catalog(_) => "catalog",
            SyncError::Archive(_) => "archive",
            SyncError::Io(_) => "io",
            SyncError::Csv(_) => "csv",
            SyncError::Json(_) => "json",
            SyncError::Storage(_) => "storage",
            SyncError::Config(_) => "config",
            SyncError::Task(_) => "task",
            SyncError::NoResourceSucceeded { .. } => "no_resource_succeeded",
            SyncError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        SyncError::Transfer {
            url,
            reason: err.to_string(),
        }
    }
}
