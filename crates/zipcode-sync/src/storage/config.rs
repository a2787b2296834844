use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_REGION: &str = "ap-northeast-1";

/// Object storage settings. Absent bucket means dry run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    /// Key prefix placed before the date partition
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            bucket: env::var("STORAGE_BUCKET").ok().filter(|b| !b.is_empty()),
            prefix: env::var("STORAGE_PREFIX").unwrap_or_default(),
            region: env::var("S3_REGION").ok(),
            endpoint: env::var("S3_ENDPOINT").ok(),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.bucket.is_none()
    }

    /// Static credentials, when both halves are configured
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bucket_with_credentials() -> StorageConfig {
        StorageConfig {
            bucket: Some("zipcode-data".to_string()),
            endpoint: Some("http://localhost:9000".to_string()),
            access_key: Some("reader".to_string()),
            secret_key: Some("hunter2".to_string()),
            path_style: true,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_static_credentials() {
        let config = bucket_with_credentials();
        assert_eq!(config.static_credentials(), Some(("reader", "hunter2")));
        assert!(!config.is_dry_run());

        let half = StorageConfig {
            secret_key: None,
            ..bucket_with_credentials()
        };
        assert_eq!(half.static_credentials(), None);
    }

    #[test]
    fn test_default_is_dry_run() {
        let config = StorageConfig::default();
        assert!(config.is_dry_run());
        assert_eq!(config.static_credentials(), None);
    }

    #[test]
    fn test_secret_is_not_serialized() {
        let json = serde_json::to_value(bucket_with_credentials()).unwrap();
        assert!(json.get("secret_key").is_none());
        assert_eq!(json["access_key"], "reader");
        assert_eq!(json["bucket"], "zipcode-data");
    }
}
