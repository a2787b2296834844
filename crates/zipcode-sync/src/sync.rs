//! Resource synchronizer
//!
//! Drives one resource through fetch, unpack and conversion:
//!
//! ```text
//! Pending -> Fetched -> Unpacked -> Converted -> Done
//!    \__________\___________\___________\______> Failed
//! ```
//!
//! A failing stage stops that resource only. The error is recorded in the
//! returned [`SyncResult`] rather than propagated, so sibling resources keep
//! running.

use crate::catalog::ResourceDescriptor;
use crate::error::{Result, SyncError};
use crate::fetch::{ArchiveFetcher, FetchOutcome};
use crate::metrics::{Metric, MetricsSink};
use crate::normalize::TextNormalizer;
use crate::unpack::ArchiveUnpacker;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

const ARCHIVE_FILE_NAME: &str = "archive.zip";
const EXTRACT_DIR_NAME: &str = "extracted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Fetched,
    Unpacked,
    Converted,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::Fetched => "fetched",
            Stage::Unpacked => "unpacked",
            Stage::Converted => "converted",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of one resource
#[derive(Debug)]
pub struct SyncResult {
    pub name: String,
    pub success: bool,
    pub record_count: u64,
    pub error: Option<SyncError>,
    /// Final state, `Done` or `Failed`
    pub stage: Stage,
    /// Last stage completed before the final state
    pub reached: Stage,
    /// Converted file, set on success
    pub output_path: Option<PathBuf>,
    /// Output file name, used as the manifest key
    pub file_name: String,
}

impl SyncResult {
    fn succeeded(descriptor: &ResourceDescriptor, record_count: u64, output_path: PathBuf) -> Self {
        Self {
            name: descriptor.name.clone(),
            success: true,
            record_count,
            error: None,
            stage: Stage::Done,
            reached: Stage::Converted,
            output_path: Some(output_path),
            file_name: descriptor.file_name(),
        }
    }

    fn failed(descriptor: &ResourceDescriptor, reached: Stage, error: SyncError) -> Self {
        Self {
            name: descriptor.name.clone(),
            success: false,
            record_count: 0,
            error: Some(error),
            stage: Stage::Failed,
            reached,
            output_path: None,
            file_name: descriptor.file_name(),
        }
    }
}

/// Shared, cheaply cloned handles to the pipeline stages
#[derive(Clone)]
pub struct ResourceSynchronizer {
    fetcher: ArchiveFetcher,
    unpacker: ArchiveUnpacker,
    normalizer: TextNormalizer,
    metrics: Arc<dyn MetricsSink>,
    package_name: String,
    cache_dir: PathBuf,
    output_dir: PathBuf,
    abandoned: Arc<AtomicBool>,
}

impl ResourceSynchronizer {
    pub fn new(
        fetcher: ArchiveFetcher,
        unpacker: ArchiveUnpacker,
        normalizer: TextNormalizer,
        metrics: Arc<dyn MetricsSink>,
        package_name: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            unpacker,
            normalizer,
            metrics,
            package_name: package_name.into(),
            cache_dir: cache_dir.into(),
            output_dir: output_dir.into(),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop every clone from moving converted output into place. Blocking
    /// work already running cannot be aborted, so this is checked before the
    /// final rename.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Cache sub-directory owned by one resource
    pub fn resource_cache_dir(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.resource_cache_dir(name).join(ARCHIVE_FILE_NAME)
    }

    pub fn output_path(&self, descriptor: &ResourceDescriptor) -> PathBuf {
        self.output_dir.join(&descriptor.local_path)
    }

    /// Synchronize one resource. Never returns an error; failures are
    /// reported in the result.
    pub async fn run(&self, descriptor: ResourceDescriptor) -> SyncResult {
        let span = info_span!("resource", resource = %descriptor.name);
        async move {
            let mut stage = Stage::Pending;
            match self.advance(&descriptor, &mut stage).await {
                Ok((record_count, output_path)) => {
                    info!(records = record_count, path = %output_path.display(), "Resource synchronized");
                    self.emit_record_count(&descriptor.name, record_count);
                    SyncResult::succeeded(&descriptor, record_count, output_path)
                },
                Err(e) => {
                    error!(
                        reached = %stage,
                        kind = e.kind(),
                        error = %e,
                        "Failed to synchronize {}",
                        descriptor.name
                    );
                    SyncResult::failed(&descriptor, stage, e)
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn advance(&self, descriptor: &ResourceDescriptor, stage: &mut Stage) -> Result<(u64, PathBuf)> {
        let archive = self.archive_path(&descriptor.name);
        if self.fetcher.fetch(&descriptor.remote_url, &archive).await? == FetchOutcome::Cached {
            info!(path = %archive.display(), "Reusing cached archive");
        }
        *stage = Stage::Fetched;

        let unpacker = self.unpacker.clone();
        let extract_dir = self.resource_cache_dir(&descriptor.name).join(EXTRACT_DIR_NAME);
        let payload = blocking(move || unpacker.unpack(&archive, &extract_dir)).await?;
        *stage = Stage::Unpacked;

        let normalizer = self.normalizer;
        let header = descriptor.field_names.clone();
        let destination = self.output_path(descriptor);
        let target = destination.clone();
        let abandoned = Arc::clone(&self.abandoned);
        let records = blocking(move || {
            normalizer.convert_unless_abandoned(&header, &payload, &target, &abandoned)
        })
        .await?;
        *stage = Stage::Converted;

        Ok((records, destination))
    }

    fn emit_record_count(&self, resource: &str, records: u64) {
        let metric = Metric::record_count(&self.package_name, resource, records);
        if let Err(e) = self.metrics.emit(&metric) {
            warn!(error = %e, "Failed to emit record count metric");
        }
    }
}

/// Run file-bound work off the async workers, carrying the current span along
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(work)).await?
}

/// Output files of the successful results, as `(file name, path)` pairs
pub fn succeeded_outputs(results: &[SyncResult]) -> Vec<(String, &Path)> {
    results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.output_path.as_deref().map(|p| (r.file_name.clone(), p)))
        .collect()
}
