//! Configuration management
//!
//! Defaults, overridden by environment variables (a `.env` file is honoured),
//! overridden in turn by command line flags in `main`.

use crate::error::{Result, SyncError};
use crate::fetch::DEFAULT_TIMEOUT_SECS;
use crate::metrics::{MetricsMode, DEFAULT_NAMESPACE, DEFAULT_PACKAGE_NAME};
use crate::normalize::{CsvQuoting, NormalizationForm, TextNormalizer};
use crate::storage::StorageConfig;
use crate::unpack::DEFAULT_PAYLOAD_SUFFIX;
use encoding_rs::Encoding;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Sync Configuration Constants
// ============================================================================

/// Default catalog location
pub const DEFAULT_CATALOG_PATH: &str = "datapackage.json";

/// Default output directory
pub const DEFAULT_OUTPUT_DIR: &str = "./build";

/// Default encoding of the published archives. Japan Post ships cp932.
pub const DEFAULT_SOURCE_ENCODING: &str = "windows-31j";

pub const DEFAULT_DESTINATION_ENCODING: &str = "UTF-8";

/// Name of the manifest written next to the outputs
pub const MANIFEST_FILE_NAME: &str = "digest.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub catalog_path: PathBuf,
    /// JSON source list replacing the built-in one
    pub sources_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Persistent archive cache; a scoped temp directory is used when unset
    pub cache_dir: Option<PathBuf>,
    pub source_encoding: String,
    pub destination_encoding: String,
    pub normalization: NormalizationForm,
    pub quoting: CsvQuoting,
    pub payload_suffix: String,
    pub http_timeout_secs: u64,
    /// Build `datapackage.zip`
    pub package: bool,
    pub storage: StorageConfig,
    pub metrics: MetricsMode,
    pub metrics_namespace: String,
    pub package_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
            sources_path: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            cache_dir: None,
            source_encoding: DEFAULT_SOURCE_ENCODING.to_string(),
            destination_encoding: DEFAULT_DESTINATION_ENCODING.to_string(),
            normalization: NormalizationForm::default(),
            quoting: CsvQuoting::default(),
            payload_suffix: DEFAULT_PAYLOAD_SUFFIX.to_string(),
            http_timeout_secs: DEFAULT_TIMEOUT_SECS,
            package: true,
            storage: StorageConfig::default(),
            metrics: MetricsMode::default(),
            metrics_namespace: DEFAULT_NAMESPACE.to_string(),
            package_name: DEFAULT_PACKAGE_NAME.to_string(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr<Err = SyncError>>(key: &str) -> Result<Option<T>> {
    env_var(key).map(|v| v.parse()).transpose()
}

/// Like [`env_parse`] for standard types, reporting the variable on failure
fn env_value<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| SyncError::Config(format!("Invalid {}={:?}: {}", key, v, e)))
        })
        .transpose()
}

impl SyncConfig {
    /// Load configuration from the environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::from_env()?;
        config.storage = StorageConfig::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `ZIPCODE_*` variables over the defaults. Storage settings are
    /// read separately by [`StorageConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            catalog_path: env_var("ZIPCODE_CATALOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            sources_path: env_var("ZIPCODE_SOURCES").map(PathBuf::from),
            output_dir: env_var("ZIPCODE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            cache_dir: env_var("ZIPCODE_CACHE_DIR").map(PathBuf::from),
            source_encoding: env_var("ZIPCODE_SOURCE_ENCODING").unwrap_or(defaults.source_encoding),
            destination_encoding: env_var("ZIPCODE_DESTINATION_ENCODING")
                .unwrap_or(defaults.destination_encoding),
            normalization: env_parse("ZIPCODE_NORMALIZATION")?.unwrap_or(defaults.normalization),
            quoting: env_parse("ZIPCODE_CSV_QUOTING")?.unwrap_or(defaults.quoting),
            payload_suffix: env_var("ZIPCODE_PAYLOAD_SUFFIX").unwrap_or(defaults.payload_suffix),
            http_timeout_secs: env_value("ZIPCODE_HTTP_TIMEOUT")?
                .unwrap_or(defaults.http_timeout_secs),
            package: env_value("ZIPCODE_PACKAGE")?.unwrap_or(defaults.package),
            storage: defaults.storage,
            metrics: env_parse("ZIPCODE_METRICS")?.unwrap_or(defaults.metrics),
            metrics_namespace: env_var("ZIPCODE_METRICS_NAMESPACE")
                .unwrap_or(defaults.metrics_namespace),
            package_name: env_var("ZIPCODE_PACKAGE_NAME").unwrap_or(defaults.package_name),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.payload_suffix.trim().is_empty() {
            return Err(SyncError::Config("Payload suffix cannot be empty".to_string()));
        }

        if self.http_timeout_secs == 0 {
            return Err(SyncError::Config(
                "HTTP timeout must be greater than 0".to_string(),
            ));
        }

        let source = resolve_encoding(&self.source_encoding)?;
        if !source.is_ascii_compatible() {
            return Err(SyncError::Config(format!(
                "Source encoding {} is not ASCII-compatible; lines cannot be split safely",
                source.name()
            )));
        }
        // encoding_rs encodes UTF-16 and `replacement` as UTF-8
        let destination = resolve_encoding(&self.destination_encoding)?;
        if !destination.is_ascii_compatible() || destination.output_encoding() != destination {
            return Err(SyncError::Config(format!(
                "Destination encoding {} cannot be written",
                destination.name()
            )));
        }

        if self.package_name.is_empty() {
            return Err(SyncError::Config("Package name cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }

    pub fn normalizer(&self) -> Result<TextNormalizer> {
        Ok(TextNormalizer {
            source_encoding: resolve_encoding(&self.source_encoding)?,
            destination_encoding: resolve_encoding(&self.destination_encoding)?,
            form: self.normalization,
            quoting: self.quoting,
        })
    }
}

/// Look up an encoding by WHATWG label, accepting the `cp932` alias
pub fn resolve_encoding(label: &str) -> Result<&'static Encoding> {
    let label = label.trim();
    let label = if label.eq_ignore_ascii_case("cp932") {
        "windows-31j"
    } else {
        label
    };
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| SyncError::Config(format!("Unknown encoding: {}", label)))
}
