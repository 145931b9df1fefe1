//! Asset catalog.
//!
//! The catalog is the source of truth for whether an asset is already
//! converted. It holds the last observed job status and the published master
//! playlist key, never intermediate pipeline state.

use crate::download::SourceLocation;
use crate::job::{current_timestamp_ms, JobStatus};
use crate::paths::{AssetPathPolicy, PathError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid catalog record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// What the catalog knows about one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub asset_id: String,
    pub source: SourceLocation,
    #[serde(default)]
    pub has_output_path: bool,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

impl CatalogRecord {
    pub fn new(asset_id: impl Into<String>, source: SourceLocation) -> Self {
        Self {
            asset_id: asset_id.into(),
            source,
            has_output_path: false,
            output_path: None,
            ready: false,
            status: JobStatus::Pending,
            error: None,
            updated_at: current_timestamp_ms(),
        }
    }

    /// Converted assets are skipped without doing any work
    pub fn is_converted(&self) -> bool {
        self.ready && self.has_output_path
    }

    pub fn mark_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = current_timestamp_ms();
    }

    pub fn mark_complete(&mut self, output_path: impl Into<String>) {
        self.has_output_path = true;
        self.output_path = Some(output_path.into());
        self.ready = true;
        self.error = None;
        self.mark_status(JobStatus::Complete);
    }

    /// Record a failure without touching the published output fields
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.mark_status(JobStatus::Failed);
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get(&self, asset_id: &str) -> Result<Option<CatalogRecord>, CatalogError>;

    async fn put(&self, record: &CatalogRecord) -> Result<(), CatalogError>;

    async fn list(&self) -> Result<Vec<CatalogRecord>, CatalogError>;
}

/// Catalog stored as one pretty-printed `<asset>.json` per asset.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    dir: PathBuf,
}

impl JsonCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, asset_id: &str) -> Result<PathBuf, CatalogError> {
        AssetPathPolicy::validate_asset_id(asset_id)?;
        Ok(self.dir.join(format!("{}.json", asset_id)))
    }
}

#[async_trait]
impl Catalog for JsonCatalog {
    async fn get(&self, asset_id: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        let path = self.record_path(asset_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, record: &CatalogRecord) -> Result<(), CatalogError> {
        let path = self.record_path(&record.asset_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(CatalogError::from)
                .and_then(|content| {
                    serde_json::from_str::<CatalogRecord>(&content).map_err(CatalogError::from)
                });
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable catalog record"),
            }
        }
        records.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(records)
    }
}
