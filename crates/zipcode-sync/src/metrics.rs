//! Metrics sinks
//!
//! The pipeline reports one `NumberOfRecords` value per converted resource.
//! Where it goes depends on the sink:
//!
//! - [`LogMetrics`]: a structured `tracing` event
//! - [`EmfMetrics`]: a CloudWatch Embedded Metric Format document on stdout,
//!   which log-ingesting runtimes (Lambda, the CloudWatch agent) turn into a
//!   metric without any API client
//! - [`NoopMetrics`]: dropped

use crate::error::{Result, SyncError};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::info;

pub const RECORD_COUNT_METRIC: &str = "NumberOfRecords";
pub const DEFAULT_NAMESPACE: &str = "Dataset";
pub const DEFAULT_PACKAGE_NAME: &str = "ZipcodeJP";

/// One metric observation
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: &'static str,
    pub dimensions: Vec<(String, String)>,
}

impl Metric {
    /// Record count for one resource of a data package
    pub fn record_count(package: &str, resource: &str, records: u64) -> Self {
        Self {
            name: RECORD_COUNT_METRIC.to_string(),
            value: records as f64,
            unit: "Count",
            dimensions: vec![
                ("DATA_PACKAGE".to_string(), package.to_string()),
                ("DATA_NAME".to_string(), resource.to_string()),
            ],
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn emit(&self, metric: &Metric) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsMode {
    None,
    #[default]
    Log,
    Emf,
}

impl std::str::FromStr for MetricsMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(MetricsMode::None),
            "log" => Ok(MetricsMode::Log),
            "emf" | "cloudwatch" => Ok(MetricsMode::Emf),
            _ => Err(SyncError::Config(format!("Unknown metrics mode: {}", s))),
        }
    }
}

/// Build the sink selected by configuration
pub fn sink_for(mode: MetricsMode, namespace: &str) -> Arc<dyn MetricsSink> {
    match mode {
        MetricsMode::None => Arc::new(NoopMetrics),
        MetricsMode::Log => Arc::new(LogMetrics),
        MetricsMode::Emf => Arc::new(EmfMetrics::stdout(namespace)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _metric: &Metric) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn emit(&self, metric: &Metric) -> Result<()> {
        let dimensions = metric
            .dimensions
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            metric = %metric.name,
            value = metric.value,
            unit = metric.unit,
            dimensions = %dimensions,
            "Metric"
        );
        Ok(())
    }
}

/// Writes CloudWatch Embedded Metric Format documents, one per line
pub struct EmfMetrics {
    namespace: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl EmfMetrics {
    pub fn new(namespace: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            namespace: namespace.into(),
            out: Mutex::new(out),
        }
    }

    pub fn stdout(namespace: impl Into<String>) -> Self {
        Self::new(namespace, Box::new(std::io::stdout()))
    }

    fn document(&self, metric: &Metric, timestamp_ms: i64) -> Value {
        let dimension_names: Vec<&str> = metric.dimensions.iter().map(|(k, _)| k.as_str()).collect();
        let mut doc = Map::new();
        doc.insert(
            "_aws".to_string(),
            json!({
                "Timestamp": timestamp_ms,
                "CloudWatchMetrics": [{
                    "Namespace": self.namespace,
                    "Dimensions": [dimension_names],
                    "Metrics": [{"Name": metric.name, "Unit": metric.unit}],
                }],
            }),
        );
        for (key, value) in &metric.dimensions {
            doc.insert(key.clone(), Value::String(value.clone()));
        }
        doc.insert(metric.name.clone(), json!(metric.value));
        Value::Object(doc)
    }
}

impl MetricsSink for EmfMetrics {
    fn emit(&self, metric: &Metric) -> Result<()> {
        let doc = self.document(metric, chrono::Utc::now().timestamp_millis());
        let line = serde_json::to_string(&doc)?;
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}
