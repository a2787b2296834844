//! Pipeline orchestrator
//!
//! One run:
//!
//! 1. pair remote sources with catalog resources (unmatched ones are logged
//!    and skipped)
//! 2. synchronize every matched resource concurrently and wait for all of them
//! 3. hash the outputs of the successful ones, optionally bundle them into
//!    `datapackage.zip`, write `digest.json`
//! 4. publish the package (or the bare data files) and then the manifest
//!
//! Nothing is written past step 2 unless at least one resource succeeded. The
//! archive cache is a scoped temp directory unless a persistent one is
//! configured; it is removed when the run ends on any path.

use crate::catalog::Catalog;
use crate::config::{SyncConfig, MANIFEST_FILE_NAME};
use crate::error::{Result, SyncError};
use crate::fetch::ArchiveFetcher;
use crate::metrics::{self, MetricsSink};
use crate::package::{build_package, PACKAGE_FILE_NAME};
use crate::sources::{default_sources, load_sources, RemoteSource};
use crate::storage::{self, KeyBuilder, StorageSink};
use crate::sync::{succeeded_outputs, ResourceSynchronizer, SyncResult};
use crate::unpack::ArchiveUnpacker;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use zipcode_common::manifest::DigestManifest;

/// Key sub-prefix for data files published without a package
pub const DATA_SUB_PREFIX: &str = "data";

/// Where archives are cached during a run
enum CacheDir {
    Scoped(TempDir),
    Persistent(PathBuf),
}

impl CacheDir {
    fn acquire(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(CacheDir::Persistent(dir.to_path_buf()))
            },
            None => Ok(CacheDir::Scoped(
                tempfile::Builder::new().prefix("zipcode-sync-").tempdir()?,
            )),
        }
    }

    fn path(&self) -> &Path {
        match self {
            CacheDir::Scoped(dir) => dir.path(),
            CacheDir::Persistent(dir) => dir,
        }
    }
}

/// Result of a run that produced a manifest
#[derive(Debug)]
pub struct RunSummary {
    pub results: Vec<SyncResult>,
    /// Sources without a catalog entry
    pub skipped: Vec<SyncError>,
    pub manifest_path: PathBuf,
    pub package_path: Option<PathBuf>,
    /// Keys uploaded, in upload order
    pub published: Vec<String>,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn total_records(&self) -> u64 {
        self.results.iter().map(|r| r.record_count).sum()
    }
}

pub struct Pipeline {
    config: SyncConfig,
    catalog: Catalog,
    sources: Vec<RemoteSource>,
    fetcher: ArchiveFetcher,
    storage: Arc<dyn StorageSink>,
    metrics: Arc<dyn MetricsSink>,
    generated_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(
        config: SyncConfig,
        catalog: Catalog,
        sources: Vec<RemoteSource>,
        storage: Arc<dyn StorageSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let fetcher = ArchiveFetcher::new(config.http_timeout())?;
        Ok(Self {
            config,
            catalog,
            sources,
            fetcher,
            storage,
            metrics,
            generated_at: None,
        })
    }

    /// Build a pipeline from configuration alone: load the catalog and the
    /// source list, and create the configured sinks
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let catalog = Catalog::load(&config.catalog_path)?;
        let sources = match &config.sources_path {
            Some(path) => load_sources(path)?,
            None => default_sources(),
        };
        let storage = storage::sink_for(&config.storage).await?;
        let metrics = metrics::sink_for(config.metrics, &config.metrics_namespace);

        info!(
            catalog = %config.catalog_path.display(),
            resources = catalog.resources.len(),
            sources = sources.len(),
            storage = %storage.describe(),
            "Pipeline configured"
        );
        Self::new(config, catalog, sources, storage, metrics)
    }

    /// Pin the manifest timestamp and the key date partition
    pub fn with_timestamp(mut self, generated_at: DateTime<Utc>) -> Self {
        self.generated_at = Some(generated_at);
        self
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let generated_at = self.generated_at.unwrap_or_else(Utc::now);

        let (descriptors, skipped) = self.catalog.match_sources(&self.sources);
        if !skipped.is_empty() {
            warn!(skipped = skipped.len(), "Some sources have no catalog entry");
        }

        let cache = CacheDir::acquire(self.config.cache_dir.as_deref())?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let synchronizer = ResourceSynchronizer::new(
            self.fetcher.clone(),
            ArchiveUnpacker::new(self.config.payload_suffix.clone()),
            self.config.normalizer()?,
            self.metrics.clone(),
            self.config.package_name.clone(),
            cache.path(),
            self.config.output_dir.clone(),
        );

        info!(
            resources = descriptors.len(),
            cache = %cache.path().display(),
            "Synchronizing resources"
        );
        let results = synchronize_all(&synchronizer, descriptors).await;

        let succeeded = results.iter().filter(|r| r.success).count();
        if succeeded == 0 {
            let failed = results.len() + skipped.len();
            error!(failed, "No resource synchronized successfully, nothing will be written");
            return Err(SyncError::NoResourceSucceeded { failed });
        }

        let (manifest_path, package_path) = self.write_artifacts(&results, generated_at).await?;
        let published = self
            .publish(&results, &manifest_path, package_path.as_deref(), generated_at)
            .await?;

        let summary = RunSummary {
            results,
            skipped,
            manifest_path,
            package_path,
            published,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped.len(),
            records = summary.total_records(),
            duration_secs = summary.duration_secs,
            "Run complete"
        );

        drop(cache);
        Ok(summary)
    }

    /// Hash the outputs, build the package, write the manifest. Runs after the
    /// join, so the manifest is never seen with a partial set of entries.
    async fn write_artifacts(
        &self,
        results: &[SyncResult],
        generated_at: DateTime<Utc>,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let outputs: Vec<(String, PathBuf)> = succeeded_outputs(results)
            .into_iter()
            .map(|(name, path)| (name, path.to_path_buf()))
            .collect();
        let catalog_path = self.config.catalog_path.clone();
        let package_path = self
            .config
            .package
            .then(|| self.config.output_dir.join(PACKAGE_FILE_NAME));
        let manifest_path = self.config.manifest_path();

        let package = package_path.clone();
        let manifest = manifest_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut digest = DigestManifest::new(generated_at);
            for (name, path) in &outputs {
                digest.add_file(name.as_str(), path)?;
            }

            if let Some(package) = &package {
                let files: Vec<(String, &Path)> = outputs
                    .iter()
                    .map(|(name, path)| (name.clone(), path.as_path()))
                    .collect();
                build_package(&catalog_path, &files, package)?;
                digest.add_file(PACKAGE_FILE_NAME, package)?;
            }

            digest.write_to(&manifest)?;
            info!(entries = digest.len(), path = %manifest.display(), "Digest manifest written");
            Ok(())
        })
        .await??;

        Ok((manifest_path, package_path))
    }

    /// Upload the package (or each data file) and then the manifest
    async fn publish(
        &self,
        results: &[SyncResult],
        manifest_path: &Path,
        package_path: Option<&Path>,
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let keys = KeyBuilder::new(&self.config.storage.prefix, generated_at.date_naive());
        let mut uploads: Vec<(&Path, String)> = Vec::new();

        match package_path {
            Some(package) => uploads.push((package, keys.key(None, PACKAGE_FILE_NAME))),
            None => {
                for (name, path) in succeeded_outputs(results) {
                    uploads.push((path, keys.key(Some(DATA_SUB_PREFIX), &name)));
                }
            },
        }
        uploads.push((manifest_path, keys.key(None, MANIFEST_FILE_NAME)));

        info!(
            sink = %self.storage.describe(),
            base = keys.base(),
            files = uploads.len(),
            "Publishing"
        );

        let mut published = Vec::with_capacity(uploads.len());
        for (path, key) in uploads {
            self.storage.upload(path, &key).await?;
            published.push(key);
        }
        Ok(published)
    }
}

/// Marks the synchronizer abandoned unless disarmed before it drops
struct AbandonOnDrop<'a> {
    synchronizer: &'a ResourceSynchronizer,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Resource tasks abandoned before completion");
            self.synchronizer.abandon();
        }
    }
}

/// Run every resource and wait for all of them, whatever their outcome.
/// Dropping the returned future aborts the tasks still in flight and keeps
/// any conversion still running on a blocking thread from publishing its
/// output file.
async fn synchronize_all(
    synchronizer: &ResourceSynchronizer,
    descriptors: Vec<crate::catalog::ResourceDescriptor>,
) -> Vec<SyncResult> {
    let mut guard = AbandonOnDrop {
        synchronizer,
        armed: true,
    };
    let mut tasks = JoinSet::new();
    for descriptor in descriptors {
        let synchronizer = synchronizer.clone();
        tasks.spawn(async move { synchronizer.run(descriptor).await });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "Resource task did not complete"),
        }
    }

    guard.armed = false;
    results.sort_by(|a, b| a.name.cmp(&b.name));
    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_cache_is_removed_on_drop() {
        let cache = CacheDir::acquire(None).unwrap();
        let path = cache.path().to_path_buf();
        std::fs::write(path.join("archive.zip"), b"x").unwrap();
        assert!(path.exists());
        drop(cache);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dropped_run_abandons_synchronizer() {
        use crate::catalog::ResourceDescriptor;
        use crate::metrics::NoopMetrics;
        use crate::normalize::TextNormalizer;
        use std::time::Duration;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let synchronizer = ResourceSynchronizer::new(
            ArchiveFetcher::new(Duration::from_secs(30)).unwrap(),
            ArchiveUnpacker::default(),
            TextNormalizer::default(),
            Arc::new(NoopMetrics),
            "ZipcodeJP",
            dir.path().join("cache"),
            dir.path().join("out"),
        );
        let descriptor = ResourceDescriptor {
            name: "roman".to_string(),
            remote_url: format!("{}/roman.zip", server.uri()),
            local_path: PathBuf::from("data/roman.csv"),
            field_names: vec!["zip".to_string()],
        };

        let run = synchronize_all(&synchronizer, vec![descriptor]);
        assert!(tokio::time::timeout(Duration::from_millis(200), run).await.is_err());
        assert!(synchronizer.is_abandoned());
    }

    #[tokio::test]
    async fn test_completed_run_is_not_abandoned() {
        use crate::metrics::NoopMetrics;
        use crate::normalize::TextNormalizer;
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let synchronizer = ResourceSynchronizer::new(
            ArchiveFetcher::new(Duration::from_secs(5)).unwrap(),
            ArchiveUnpacker::default(),
            TextNormalizer::default(),
            Arc::new(NoopMetrics),
            "ZipcodeJP",
            dir.path().join("cache"),
            dir.path().join("out"),
        );

        assert!(synchronize_all(&synchronizer, Vec::new()).await.is_empty());
        assert!(!synchronizer.is_abandoned());
    }

    #[test]
    fn test_persistent_cache_survives_drop() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("cache");
        let cache = CacheDir::acquire(Some(&dir)).unwrap();
        assert_eq!(cache.path(), dir.as_path());
        drop(cache);
        assert!(dir.exists());
    }
}
