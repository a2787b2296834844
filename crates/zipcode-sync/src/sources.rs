//! Remote source list
//!
//! Maps resource names to the archive URLs they are built from. The built-in
//! list covers the Japan Post downloads; a JSON file can replace it, either
//! as an object (`{"facility": "https://..."}`) or as an array of
//! `{"name", "url"}` objects.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Base URL of the Japan Post download area
pub const DATA_SOURCE_BASE_URL: &str = "https://www.post.japanpost.jp/zipcode/dl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSource {
    pub name: String,
    pub url: String,
}

impl RemoteSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceFile {
    List(Vec<RemoteSource>),
    Map(BTreeMap<String, String>),
}

/// The archives published by Japan Post
pub fn default_sources() -> Vec<RemoteSource> {
    [
        ("ken_all_oogaki", "/oogaki/zip/ken_all.zip"),
        ("ken_all_kogaki", "/kogaki/zip/ken_all.zip"),
        ("ken_all_roman", "/roman/ken_all_rome.zip"),
        ("facility", "/jigyosyo/zip/jigyosyo.zip"),
    ]
    .into_iter()
    .map(|(name, path)| RemoteSource::new(name, format!("{}{}", DATA_SOURCE_BASE_URL, path)))
    .collect()
}

pub fn parse_sources(text: &str) -> Result<Vec<RemoteSource>> {
    let parsed: SourceFile = serde_json::from_str(text)
        .map_err(|e| SyncError::Config(format!("Invalid source list: {}", e)))?;

    let sources = match parsed {
        SourceFile::List(list) => list,
        SourceFile::Map(map) => map
            .into_iter()
            .map(|(name, url)| RemoteSource { name, url })
            .collect(),
    };

    let mut seen = std::collections::HashSet::new();
    for source in &sources {
        if !seen.insert(source.name.as_str()) {
            return Err(SyncError::Config(format!(
                "Source '{}' is listed more than once",
                source.name
            )));
        }
    }

    Ok(sources)
}

pub fn load_sources(path: impl AsRef<Path>) -> Result<Vec<RemoteSource>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Config(format!("Failed to read source list {}: {}", path.display(), e))
    })?;
    parse_sources(&text)
}
