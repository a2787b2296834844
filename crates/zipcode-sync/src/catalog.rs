//! Data package catalog
//!
//! The catalog is the `datapackage.json` descriptor shipped with the data:
//! every resource's name, output path and field schema. Remote sources are
//! matched against it by resource name.

use crate::error::{Result, SyncError};
use crate::sources::RemoteSource;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub resources: Vec<CatalogResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogResource {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub schema: Schema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

/// One schema field. Older catalogs name fields with `id`; `name` wins
/// when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Field {
    pub fn field_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.id.as_deref())
    }
}

/// A catalog resource paired with the archive it is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub remote_url: String,
    /// Output path relative to the output directory, e.g. `data/facility.csv`
    pub local_path: PathBuf,
    pub field_names: Vec<String>,
}

impl ResourceDescriptor {
    /// Output file name, used as the manifest key and the package entry name
    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Catalog(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_json(&text)?;
        debug!(
            path = %path.display(),
            resources = catalog.resources.len(),
            "Loaded catalog"
        );
        Ok(catalog)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(text)
            .map_err(|e| SyncError::Catalog(format!("Invalid catalog JSON: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reject catalogs whose resources would collide or escape the output dir
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut files = HashSet::new();

        for resource in &self.resources {
            if !names.insert(resource.name.as_str()) {
                return Err(SyncError::Catalog(format!(
                    "Duplicate resource name '{}'",
                    resource.name
                )));
            }

            // The name doubles as the resource's cache directory
            let mut parts = Path::new(&resource.name).components();
            if !matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None)) {
                return Err(SyncError::Catalog(format!(
                    "Invalid resource name '{}'",
                    resource.name
                )));
            }

            let path = Path::new(&resource.path);
            let safe = path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !safe || path.file_name().is_none() {
                return Err(SyncError::Catalog(format!(
                    "Resource '{}' has an invalid path '{}'",
                    resource.name, resource.path
                )));
            }
            if !files.insert(path.file_name()) {
                return Err(SyncError::Catalog(format!(
                    "Resource '{}' reuses output file name of '{}'",
                    resource.name, resource.path
                )));
            }

            if let Some(index) = resource.schema.fields.iter().position(|f| f.field_name().is_none()) {
                return Err(SyncError::Catalog(format!(
                    "Field #{} of resource '{}' has neither 'name' nor 'id'",
                    index + 1,
                    resource.name
                )));
            }
        }

        Ok(())
    }

    /// Output file name of each resource mapped to its relative path
    pub fn output_paths(&self) -> HashMap<String, PathBuf> {
        self.resources
            .iter()
            .filter_map(|r| {
                let path = PathBuf::from(&r.path);
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some((name, path))
            })
            .collect()
    }

    pub fn lookup(&self, name: &str) -> Option<&CatalogResource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Pair each remote source with its catalog resource.
    ///
    /// Sources without a catalog entry come back as `CatalogMismatch`
    /// errors; they are reported and skipped, never fatal.
    pub fn match_sources(&self, sources: &[RemoteSource]) -> (Vec<ResourceDescriptor>, Vec<SyncError>) {
        let mut matched = Vec::new();
        let mut unmatched = Vec::new();

        for source in sources {
            match self.lookup(&source.name) {
                Some(resource) => matched.push(ResourceDescriptor {
                    name: resource.name.clone(),
                    remote_url: source.url.clone(),
                    local_path: PathBuf::from(&resource.path),
                    field_names: resource
                        .schema
                        .fields
                        .iter()
                        .filter_map(|f| f.field_name().map(str::to_string))
                        .collect(),
                }),
                None => {
                    error!(resource = %source.name, "Resource is not found in the data package catalog");
                    unmatched.push(SyncError::CatalogMismatch {
                        name: source.name.clone(),
                    });
                },
            }
        }

        (matched, unmatched)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "name": "zipcodejp",
        "title": "Japanese postal codes",
        "resources": [
            {
                "name": "ken_all_roman",
                "path": "data/ken_all_roman.csv",
                "schema": {
                    "fields": [
                        {"name": "zip", "type": "string", "constraints": {"required": true}},
                        {"id": "prefecture", "type": "string"},
                        {"name": "city", "id": "legacy_city", "type": "string"}
                    ]
                }
            },
            {
                "name": "facility",
                "path": "data/facility.csv",
                "schema": {"fields": [{"name": "jis_code", "type": "integer"}]}
            }
        ]
    }"#;

    fn source(name: &str) -> RemoteSource {
        RemoteSource {
            name: name.to_string(),
            url: format!("https://example.test/{}.zip", name),
        }
    }

    #[test]
    fn test_field_names_prefer_name_over_id() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let (matched, unmatched) = catalog.match_sources(&[source("ken_all_roman")]);

        assert!(unmatched.is_empty());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].field_names, vec!["zip", "prefecture", "city"]);
        assert_eq!(matched[0].local_path, PathBuf::from("data/ken_all_roman.csv"));
        assert_eq!(matched[0].file_name(), "ken_all_roman.csv");
        assert_eq!(matched[0].remote_url, "https://example.test/ken_all_roman.zip");
    }

    #[test]
    fn test_unmatched_source_is_reported_not_fatal() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let (matched, unmatched) =
            catalog.match_sources(&[source("facility"), source("ken_all_kogaki")]);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "facility");
        assert_eq!(unmatched.len(), 1);
        assert!(matches!(
            &unmatched[0],
            SyncError::CatalogMismatch { name } if name == "ken_all_kogaki"
        ));
    }

    #[test]
    fn test_extra_field_keys_survive_round_trip() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let field = &catalog.lookup("ken_all_roman").unwrap().schema.fields[0];
        assert!(field.extra.contains_key("constraints"));
        let json = serde_json::to_value(field).unwrap();
        assert_eq!(json["constraints"]["required"], true);
        assert_eq!(json["type"], "string");
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let json = r#"{"name":"p","resources":[
            {"name":"a","path":"data/a.csv","schema":{"fields":[]}},
            {"name":"a","path":"data/b.csv","schema":{"fields":[]}}
        ]}"#;
        assert!(matches!(Catalog::from_json(json), Err(SyncError::Catalog(_))));
    }

    #[test]
    fn test_rejects_colliding_output_files() {
        let json = r#"{"name":"p","resources":[
            {"name":"a","path":"data/x.csv","schema":{"fields":[]}},
            {"name":"b","path":"other/x.csv","schema":{"fields":[]}}
        ]}"#;
        assert!(matches!(Catalog::from_json(json), Err(SyncError::Catalog(_))));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        for bad in ["../x.csv", "/etc/x.csv", "data/.."] {
            let json = format!(
                r#"{{"name":"p","resources":[{{"name":"a","path":"{}","schema":{{"fields":[]}}}}]}}"#,
                bad
            );
            assert!(Catalog::from_json(&json).is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_rejects_names_that_are_not_plain_segments() {
        for bad in ["../x", "a/b", "/abs", "..", ".", ""] {
            let json = format!(
                r#"{{"name":"p","resources":[{{"name":"{}","path":"data/a.csv","schema":{{"fields":[]}}}}]}}"#,
                bad
            );
            assert!(
                matches!(Catalog::from_json(&json), Err(SyncError::Catalog(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_rejects_unnamed_field() {
        let json = r#"{"name":"p","resources":[
            {"name":"a","path":"data/a.csv","schema":{"fields":[{"type":"string"}]}}
        ]}"#;
        assert!(Catalog::from_json(json).is_err());
    }

    #[test]
    fn test_output_paths_by_file_name() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let paths = catalog.output_paths();
        assert_eq!(paths["facility.csv"], PathBuf::from("data/facility.csv"));
        assert_eq!(paths["ken_all_roman.csv"], PathBuf::from("data/ken_all_roman.csv"));
    }
}
