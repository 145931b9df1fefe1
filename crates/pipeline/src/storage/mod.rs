//! Object store abstraction.
//!
//! The publisher and downloader only need list/put/get/delete/head semantics,
//! so they talk to an [`ObjectStore`]. [`S3Store`] targets S3-compatible
//! endpoints (R2), [`MemoryStore`] backs tests and dry runs.

mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to configure storage client: {0}")]
    ConfigError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("List failed: {0}")]
    ListFailed(String),

    #[error("Head failed: {0}")]
    HeadFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::DownloadFailed(msg.into())
    }

    pub fn delete_failed(msg: impl Into<String>) -> Self {
        Self::DeleteFailed(msg.into())
    }

    /// Whether another attempt could succeed. Missing objects, missing local
    /// files and bad client configuration stay broken.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConfigError(_) | Self::NotFound(_) => false,
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => true,
        }
    }
}

/// Object metadata from a listing or head request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// Token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Metadata attached to an uploaded object.
#[derive(Debug, Clone, PartialEq)]
pub struct PutOptions {
    pub content_type: String,
    pub cache_control: Option<String>,
}

impl PutOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            cache_control: None,
        }
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }
}

/// Remote object store used as the system of record for published output.
///
/// Listings may lag recent writes; callers re-list instead of trusting their
/// own upload history.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// One page of keys under `prefix`.
    async fn list_page(&self, prefix: &str, token: Option<String>) -> StorageResult<ListPage>;

    /// Every key under `prefix`, following continuation tokens.
    async fn list_all(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token = None;
        loop {
            let page = self.list_page(prefix, token).await?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    /// Upload a local file; returns the number of bytes sent.
    async fn put_file(&self, key: &str, path: &Path, options: &PutOptions) -> StorageResult<u64>;

    /// Stream an object into a local file; returns the number of bytes written.
    async fn get_to_file(&self, key: &str, path: &Path) -> StorageResult<u64>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Metadata for `key`, or `None` if it does not exist.
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>>;
}

/// Content type for a published file, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "m4s" => "video/iso.segment",
        "mp4" => "video/mp4",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Write the body of a download to `<path>.part`, then move it into place.
pub(crate) fn partial_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Outcome of a credentials and reachability check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreCheck {
    pub prefix: String,
    /// Keys on the first listing page
    pub listed: usize,
    pub truncated: bool,
}

/// List one page under `root` to prove the store accepts our credentials.
pub async fn check_access(store: &dyn ObjectStore, root: &str) -> StorageResult<StoreCheck> {
    let prefix = format!("{}/", root.trim_end_matches('/'));
    let page = store.list_page(&prefix, None).await?;
    Ok(StoreCheck {
        listed: page.objects.len(),
        truncated: page.next_token.is_some(),
        prefix,
    })
}
