//! Source download into a job workspace.
//!
//! HTTP sources are streamed to `<dest>.part` and renamed once complete, so an
//! interrupted download never leaves a truncated file under the final name.
//! Store sources go through [`ObjectStore::get_to_file`], which does the same.

use crate::retry::{retry_async_if, RetryConfig, RetryOutcome};
use crate::storage::{partial_path, ObjectStore, StorageError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Extension used when a source name does not carry a usable one
pub const DEFAULT_SOURCE_EXTENSION: &str = "mp4";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Download timed out after {0:?}")]
    Timeout(Duration),

    #[error("Downloaded source is empty")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Client errors other than 408 and 429 will not change on retry, and
    /// neither will a missing object.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Status { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            DownloadError::Storage(e) => e.is_retryable(),
            _ => true,
        }
    }
}

/// Where a job's source video lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceLocation {
    /// `http://` or `https://` URL
    Url(String),
    /// Key in the object store
    Object(String),
}

impl SourceLocation {
    pub fn parse(value: &str) -> Self {
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceLocation::Url(value.to_string())
        } else {
            SourceLocation::Object(value.trim_start_matches('/').to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceLocation::Url(s) | SourceLocation::Object(s) => s,
        }
    }

    /// File extension of the source, lowercased, `mp4` when unknown
    pub fn extension(&self) -> String {
        let path = match self {
            SourceLocation::Url(url) => url.split(['?', '#']).next().unwrap_or(url.as_str()),
            SourceLocation::Object(key) => key.as_str(),
        };
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty()
                    && (1..=5).contains(&ext.len())
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext.to_ascii_lowercase()
            }
            _ => DEFAULT_SOURCE_EXTENSION.to_string(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SourceLocation {
    fn from(value: String) -> Self {
        SourceLocation::parse(&value)
    }
}

impl From<SourceLocation> for String {
    fn from(value: SourceLocation) -> Self {
        match value {
            SourceLocation::Url(s) | SourceLocation::Object(s) => s,
        }
    }
}

/// Fetches job sources with retry and an overall per-attempt timeout.
#[derive(Clone)]
pub struct Downloader {
    http: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    retry: RetryConfig,
    timeout: Duration,
}

impl Downloader {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            retry,
            timeout,
        }
    }

    /// Make `dest` hold the source; returns its size in bytes.
    ///
    /// A non-empty file already at `dest` is kept as is.
    pub async fn fetch(&self, source: &SourceLocation, dest: &Path) -> Result<u64, DownloadError> {
        if let Ok(meta) = tokio::fs::metadata(dest).await {
            if meta.is_file() && meta.len() > 0 {
                info!(path = %dest.display(), bytes = meta.len(), "Reusing downloaded source");
                return Ok(meta.len());
            }
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let timeout = self.timeout;
        let outcome = retry_async_if(&self.retry, DownloadError::is_retryable, |attempt| async move {
            debug!(source = %source, attempt, "Downloading source");
            match tokio::time::timeout(timeout, self.fetch_once(source, dest)).await {
                Ok(result) => result,
                Err(_) => Err(DownloadError::Timeout(timeout)),
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success(bytes) => {
                info!(source = %source, bytes, "Source downloaded");
                Ok(bytes)
            }
            RetryOutcome::Exhausted { error, .. } => {
                let _ = tokio::fs::remove_file(partial_path(dest)).await;
                Err(error)
            }
        }
    }

    async fn fetch_once(&self, source: &SourceLocation, dest: &Path) -> Result<u64, DownloadError> {
        let bytes = match source {
            SourceLocation::Url(url) => self.fetch_url(url, dest).await?,
            SourceLocation::Object(key) => self.store.get_to_file(key, dest).await?,
        };
        if bytes == 0 {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(DownloadError::Empty);
        }
        Ok(bytes)
    }

    async fn fetch_url(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let part = partial_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part, dest).await?;
        Ok(written)
    }
}
