//! Zipcode Sync - Japanese postal code data package builder

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use zipcode_common::logging::{init_logging, LogConfig, LogLevel};
use zipcode_common::manifest::{DigestManifest, EntryStatus};
use zipcode_sync::metrics::MetricsMode;
use zipcode_sync::normalize::CsvQuoting;
use zipcode_sync::{Catalog, Pipeline, RunSummary, SyncConfig, SyncError};

#[derive(Parser, Debug)]
#[command(name = "zipcode-sync")]
#[command(author, version, about = "Japanese postal code data package builder")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download, convert and publish every resource
    Sync(SyncArgs),

    /// Check files against a digest manifest
    Verify {
        /// Manifest to check
        #[arg(short, long, default_value = "./build/digest.json")]
        manifest: PathBuf,

        /// Directory holding the listed files (defaults to the manifest's)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Catalog used to locate data files below the directory
        #[arg(long, env = "ZIPCODE_CATALOG", default_value = "datapackage.json")]
        catalog: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Data package catalog
    #[arg(long, env = "ZIPCODE_CATALOG")]
    catalog: Option<PathBuf>,

    /// JSON source list replacing the built-in one
    #[arg(long, env = "ZIPCODE_SOURCES")]
    sources: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, env = "ZIPCODE_OUTPUT_DIR")]
    output: Option<PathBuf>,

    /// Persistent archive cache (a temporary one is used otherwise)
    #[arg(long, env = "ZIPCODE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Storage bucket; without one uploads are only logged
    #[arg(long, env = "STORAGE_BUCKET")]
    bucket: Option<String>,

    /// Key prefix placed before the date partition
    #[arg(long, env = "STORAGE_PREFIX")]
    prefix: Option<String>,

    /// Skip building datapackage.zip
    #[arg(long)]
    no_package: bool,

    /// CSV quoting: verbatim, necessary or non-numeric
    #[arg(long, env = "ZIPCODE_CSV_QUOTING")]
    quoting: Option<CsvQuoting>,

    /// Metrics sink: none, log or emf
    #[arg(long, env = "ZIPCODE_METRICS")]
    metrics: Option<MetricsMode>,
}

impl SyncArgs {
    /// Apply flags over the environment-derived configuration
    fn apply(self, config: &mut SyncConfig) {
        if let Some(catalog) = self.catalog {
            config.catalog_path = catalog;
        }
        if self.sources.is_some() {
            config.sources_path = self.sources;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if self.cache_dir.is_some() {
            config.cache_dir = self.cache_dir;
        }
        if let Some(bucket) = self.bucket {
            config.storage.bucket = Some(bucket).filter(|b| !b.is_empty());
        }
        if let Some(prefix) = self.prefix {
            config.storage.prefix = prefix;
        }
        if self.no_package {
            config.package = false;
        }
        if let Some(quoting) = self.quoting {
            config.quoting = quoting;
        }
        if let Some(metrics) = self.metrics {
            config.metrics = metrics;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("zipcode-sync")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        },
    };

    let result = match cli.command {
        Command::Verify {
            manifest,
            dir,
            catalog,
        } => verify(manifest, dir, catalog),
        Command::Sync(args) => sync(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn sync(args: SyncArgs) -> Result<ExitCode> {
    let mut config = SyncConfig::load().context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let pipeline = Pipeline::from_config(config)
        .await
        .context("Failed to set up the pipeline")?;

    tokio::select! {
        result = pipeline.run() => {
            match result {
                Ok(summary) => {
                    print_summary(&summary);
                    Ok(ExitCode::SUCCESS)
                },
                Err(SyncError::NoResourceSucceeded { failed }) => {
                    eprintln!("No resource synchronized ({} failed); nothing was written", failed);
                    Ok(ExitCode::FAILURE)
                },
                Err(e) => Err(e).context("Run failed"),
            }
        },
        _ = shutdown_signal() => {
            warn!("Run abandoned, nothing was published");
            Err(SyncError::Cancelled.into())
        },
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Resources:");
    for result in &summary.results {
        match &result.error {
            None => println!("  ✓ {:<20} {:>10} records", result.name, result.record_count),
            Some(e) => println!("  ✗ {:<20} {} (after {})", result.name, e, result.reached),
        }
    }
    for skipped in &summary.skipped {
        println!("  - {}", skipped);
    }
    println!();
    println!(
        "{} succeeded, {} failed, {} skipped in {:.1}s",
        summary.succeeded(),
        summary.failed(),
        summary.skipped.len(),
        summary.duration_secs
    );
    println!("Manifest: {}", summary.manifest_path.display());
    if let Some(package) = &summary.package_path {
        println!("Package:  {}", package.display());
    }
    for key in &summary.published {
        println!("Published {}", key);
    }
}

fn verify(manifest_path: PathBuf, dir: Option<PathBuf>, catalog: PathBuf) -> Result<ExitCode> {
    let manifest = DigestManifest::from_path(&manifest_path)
        .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
    let dir = dir
        .or_else(|| manifest_path.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    // Without a catalog every entry is looked up directly under the directory
    let layout = match Catalog::load(&catalog) {
        Ok(catalog) => catalog.output_paths(),
        Err(e) => {
            warn!(catalog = %catalog.display(), error = %e, "Catalog unavailable, using flat layout");
            HashMap::new()
        },
    };

    info!(manifest = %manifest_path.display(), dir = %dir.display(), entries = manifest.len(), "Verifying");
    let report = manifest.verify_with(|name| match layout.get(name) {
        Some(relative) => dir.join(relative),
        None => dir.join(name),
    })?;

    let mut bad = 0;
    for (name, status) in &report {
        match status {
            EntryStatus::Ok => println!("  ✓ {}", name),
            EntryStatus::Missing => {
                bad += 1;
                println!("  ✗ {} missing", name);
            },
            EntryStatus::SizeMismatch { expected, actual } => {
                bad += 1;
                println!("  ✗ {} size {} (expected {})", name, actual, expected);
            },
            EntryStatus::DigestMismatch { expected, actual } => {
                bad += 1;
                println!("  ✗ {} digest {} (expected {})", name, actual, expected);
            },
        }
    }

    println!("{} of {} entries verified", report.len() - bad, report.len());
    Ok(if bad == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, abandoning run"),
        _ = terminate => info!("Received terminate signal, abandoning run"),
    }
}
