//! Archive fetcher
//!
//! Downloads a remote archive into the cache. A file already present at the
//! destination counts as fetched; there is no freshness check.

use crate::error::{Result, SyncError};
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Default request timeout for a single archive transfer
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const USER_AGENT: &str = concat!("zipcode-sync/", env!("CARGO_PKG_VERSION"));

/// What a fetch call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Destination existed already; nothing was transferred
    Cached,
    /// Archive was downloaded; carries the byte count
    Downloaded(u64),
}

/// HTTP client for archive downloads
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: Client,
}

impl ArchiveFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Fetch `url` to `destination` unless it is already there.
    ///
    /// The body is streamed to a `.part` sibling which is renamed into place
    /// only after the last byte is flushed, so an interrupted transfer never
    /// looks like a cached archive.
    pub async fn fetch(&self, url: &str, destination: &Path) -> Result<FetchOutcome> {
        if tokio::fs::try_exists(destination).await? {
            debug!(path = %destination.display(), "Archive already cached");
            return Ok(FetchOutcome::Cached);
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(destination);
        match self.download(url, &partial).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, destination).await?;
                info!(url, bytes, path = %destination.display(), "Downloaded archive");
                Ok(FetchOutcome::Downloaded(bytes))
            },
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            },
        }
    }

    async fn download(&self, url: &str, partial: &Path) -> Result<u64> {
        info!(url, "Downloading archive");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::transfer(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::transfer(url, format!("HTTP status {}", status)));
        }

        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SyncError::transfer(url, e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> ArchiveFetcher {
        ArchiveFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_second_fetch_is_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ken_all.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04payload".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ken_all_oogaki.zip");
        let url = format!("{}/ken_all.zip", server.uri());

        let first = fetcher().fetch(&url, &dest).await.unwrap();
        assert_eq!(first, FetchOutcome::Downloaded(11));
        let second = fetcher().fetch(&url, &dest).await.unwrap();
        assert_eq!(second, FetchOutcome::Cached);

        assert_eq!(std::fs::read(&dest).unwrap(), b"PK\x03\x04payload");
        // `expect(1)` is checked when the server drops
    }

    #[tokio::test]
    async fn test_http_error_is_transfer_error_and_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("missing.zip");
        let url = format!("{}/missing.zip", server.uri());

        let err = fetcher().fetch(&url, &dest).await.unwrap_err();
        match err {
            SyncError::Transfer { url: failed, reason } => {
                assert_eq!(failed, url);
                assert!(reason.contains("404"));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transfer_error() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nowhere.zip");

        let err = fetcher()
            .fetch("http://127.0.0.1:1/nowhere.zip", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transfer { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_stale_partial_file_is_not_treated_as_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"complete".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("facility.zip");
        std::fs::write(partial_path(&dest), b"trunc").unwrap();

        let outcome = fetcher()
            .fetch(&format!("{}/jigyosyo.zip", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Downloaded(8));
        assert_eq!(std::fs::read(&dest).unwrap(), b"complete");
    }
}
