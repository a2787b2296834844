//! Publishing sinks for the finished package
//!
//! Keys are date partitioned: `[prefix/]YYYY/MMDD/[sub_prefix/]<file name>`.
//! Without a configured bucket the [`DryRunStorage`] sink only logs what
//! would have been uploaded.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub mod config;

pub use config::StorageConfig;

/// Destination for published files
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;

    /// Human-readable target, used in logs and the run summary
    fn describe(&self) -> String;
}

/// Builds date-partitioned object keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    base: String,
}

impl KeyBuilder {
    pub fn new(prefix: &str, date: NaiveDate) -> Self {
        let mut base = prefix.trim_start_matches('/').to_string();
        if !base.is_empty() && !base.ends_with('/') {
            base.push('/');
        }
        base.push_str(&date.format("%Y/%m%d/").to_string());
        Self { base }
    }

    /// Common prefix of every key in this run
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn key(&self, sub_prefix: Option<&str>, file_name: &str) -> String {
        match sub_prefix.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            Some(sub) => format!("{}{}/{}", self.base, sub, file_name),
            None => format!("{}{}", self.base, file_name),
        }
    }
}

/// Build the sink selected by configuration
pub async fn sink_for(config: &StorageConfig) -> Result<Arc<dyn StorageSink>> {
    if config.is_dry_run() {
        info!("No storage bucket configured, uploads will only be logged");
        return Ok(Arc::new(DryRunStorage));
    }
    Ok(Arc::new(S3Storage::new(config).await?))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunStorage;

#[async_trait]
impl StorageSink for DryRunStorage {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        info!("MOCK - upload \"{}\" to \"{}\"", local_path.display(), key);
        Ok(())
    }

    fn describe(&self) -> String {
        "dry run".to_string()
    }
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| SyncError::Config("S3 storage requires a bucket".to_string()))?;

        let region = RegionProviderChain::first_try(config.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(config::DEFAULT_REGION);
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region)
            .load()
            .await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.path_style);

        if let Some((access_key, secret_key)) = config.static_credentials() {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "zipcode-storage",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %bucket, "Storage client initialized");

        Ok(Self { client, bucket })
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("csv") => "text/csv; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl StorageSink for S3Storage {
    #[instrument(skip(self))]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        info!(
            "uploading \"{}\" to \"{}\" in \"{}\" bucket",
            local_path.display(),
            key,
            self.bucket
        );

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to open {}: {}", local_path.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type(local_path))
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to upload s3://{}/{}: {}", self.bucket, key, e)))?;

        debug!("Successfully uploaded to s3://{}/{}", self.bucket, key);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
