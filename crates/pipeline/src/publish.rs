//! Resumable publisher
//!
//! Reconciles a job's local rendition directories against what the object
//! store already holds and uploads only the difference. Publishing is
//! idempotent: a re-run after a crash lists the prefix again and continues
//! where the previous run stopped. There is no separate resume path.
//!
//! Upload order:
//! 1. segments missing remotely, in bounded concurrent batches with a pause between batches
//! 2. rendition playlists missing remotely
//! 3. completeness check (re-list, then `head` for anything the listing lags on)
//! 4. master playlist, only if missing and only once every rendition is complete
//!
//! The master playlist therefore never references a rendition that is not
//! fully present.

use crate::config::PublishConfig;
use crate::encode::RenditionOutput;
use crate::paths::{AssetPathPolicy, PathError};
use crate::retry::{retry_async_if, RetryConfig, RetryOutcome};
use crate::storage::{content_type_for, ObjectStore, PutOptions, StorageError};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to list remote objects: {0}")]
    List(#[source] StorageError),

    #[error(transparent)]
    Path(#[from] PathError),

    /// Some required objects are still absent after uploading
    #[error("Publish incomplete, {} objects missing (first: {})", .missing.len(), .missing.first().map(String::as_str).unwrap_or("-"))]
    Incomplete { missing: Vec<String> },
}

/// Publisher tuning derived from the `[publish]` config section
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub retry: RetryConfig,
    pub upload_timeout: Duration,
    pub segment_cache_control: String,
    pub playlist_cache_control: String,
}

impl PublishSettings {
    pub fn from_config(cfg: &PublishConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            batch_delay: Duration::from_millis(cfg.batch_delay_ms),
            retry: RetryConfig::new("upload")
                .with_max_attempts(cfg.max_attempts)
                .with_base_delay(Duration::from_millis(cfg.base_backoff_ms))
                .with_max_delay(Duration::from_millis(cfg.max_backoff_ms)),
            upload_timeout: Duration::from_secs(cfg.upload_timeout_secs.max(1)),
            segment_cache_control: cfg.segment_cache_control.clone(),
            playlist_cache_control: cfg.playlist_cache_control.clone(),
        }
    }
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self::from_config(&PublishConfig::default())
    }
}

/// What one publish run did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishReport {
    /// Objects uploaded by this run
    pub uploaded: usize,
    /// Segments uploaded by this run (subset of `uploaded`)
    pub segments_uploaded: usize,
    /// Objects found already present and left alone
    pub already_present: usize,
    /// Keys whose upload failed after every retry
    pub skipped: Vec<String>,
    pub bytes_uploaded: u64,
    pub master_uploaded: bool,
}

#[derive(Debug, Clone)]
struct UploadItem {
    key: String,
    path: PathBuf,
    options: PutOptions,
}

#[derive(Debug, Default)]
struct BatchTotals {
    uploaded: usize,
    bytes: u64,
    skipped: Vec<String>,
}

/// Uploads local HLS output for one asset into the object store.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    paths: AssetPathPolicy,
    settings: PublishSettings,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, paths: AssetPathPolicy, settings: PublishSettings) -> Self {
        Self {
            store,
            paths,
            settings,
        }
    }

    pub fn paths(&self) -> &AssetPathPolicy {
        &self.paths
    }

    /// Every remote key a complete publish of `renditions` consists of, master first
    pub fn manifest_keys(
        &self,
        asset_id: &str,
        renditions: &[RenditionOutput],
    ) -> Result<Vec<String>, PathError> {
        let mut keys = vec![self.paths.master_key(asset_id)?];
        for rendition in renditions {
            keys.push(self.paths.rendition_playlist_key(asset_id, &rendition.name)?);
            for segment in &rendition.segments {
                keys.push(self.paths.segment_key(asset_id, &rendition.name, segment)?);
            }
        }
        Ok(keys)
    }

    /// Publish `renditions` and `master_playlist` under the asset's prefix.
    pub async fn publish(
        &self,
        asset_id: &str,
        renditions: &[RenditionOutput],
        master_playlist: &Path,
    ) -> Result<PublishReport, PublishError> {
        let listed = self.list_keys(asset_id).await?;
        let mut report = PublishReport::default();

        // segments: local minus remote
        let mut pending = Vec::new();
        for rendition in renditions {
            let mut missing_here = 0usize;
            for segment in &rendition.segments {
                let key = self.paths.segment_key(asset_id, &rendition.name, segment)?;
                if listed.contains(&key) {
                    report.already_present += 1;
                } else {
                    missing_here += 1;
                    pending.push(UploadItem {
                        path: rendition.segment_path(segment),
                        options: self.segment_options(segment),
                        key,
                    });
                }
            }
            debug!(
                asset_id,
                rendition = %rendition.name,
                local = rendition.segments.len(),
                missing = missing_here,
                "Segment difference computed"
            );
        }

        info!(
            asset_id,
            to_upload = pending.len(),
            already_present = report.already_present,
            "Uploading segments"
        );
        let totals = self.upload_batches(&pending).await;
        report.segments_uploaded = totals.uploaded;
        self.absorb(&mut report, totals);

        // rendition playlists, only if missing
        let mut playlists = Vec::new();
        for rendition in renditions {
            let key = self.paths.rendition_playlist_key(asset_id, &rendition.name)?;
            if listed.contains(&key) {
                report.already_present += 1;
            } else {
                playlists.push(UploadItem {
                    path: rendition.playlist.clone(),
                    options: self.playlist_options(),
                    key,
                });
            }
        }
        let totals = self.upload_batches(&playlists).await;
        self.absorb(&mut report, totals);

        let missing = self.missing_renditions(asset_id, renditions).await?;
        if !missing.is_empty() {
            warn!(
                asset_id,
                missing = missing.len(),
                skipped = report.skipped.len(),
                "Renditions incomplete, master playlist withheld"
            );
            return Err(PublishError::Incomplete { missing });
        }

        let master_key = self.paths.master_key(asset_id)?;
        if listed.contains(&master_key) {
            report.already_present += 1;
        } else {
            let item = UploadItem {
                key: master_key.clone(),
                path: master_playlist.to_path_buf(),
                options: self.playlist_options(),
            };
            match self.upload_one(&item).await {
                Ok(bytes) => {
                    report.uploaded += 1;
                    report.bytes_uploaded += bytes;
                    report.master_uploaded = true;
                }
                Err(e) => {
                    warn!(asset_id, key = %master_key, error = %e, "Master playlist upload failed");
                    report.skipped.push(master_key.clone());
                    return Err(PublishError::Incomplete {
                        missing: vec![master_key],
                    });
                }
            }
        }

        info!(
            asset_id,
            uploaded = report.uploaded,
            already_present = report.already_present,
            bytes = report.bytes_uploaded,
            "Publish complete"
        );
        Ok(report)
    }

    /// Keys required by `renditions` that the store does not hold.
    ///
    /// Re-lists the prefix and falls back to `head` for keys the listing does
    /// not show yet.
    pub async fn missing_renditions(
        &self,
        asset_id: &str,
        renditions: &[RenditionOutput],
    ) -> Result<Vec<String>, PublishError> {
        let listed = self.list_keys(asset_id).await?;
        let mut missing = Vec::new();

        for key in self.manifest_keys(asset_id, renditions)?.into_iter().skip(1) {
            if listed.contains(&key) {
                continue;
            }
            match self.store.head(&key).await {
                Ok(Some(_)) => {
                    debug!(key = %key, "Object present but not yet listed");
                }
                Ok(None) => missing.push(key),
                Err(e) => {
                    warn!(key = %key, error = %e, "Head request failed, counting object as missing");
                    missing.push(key);
                }
            }
        }
        Ok(missing)
    }

    async fn list_keys(&self, asset_id: &str) -> Result<HashSet<String>, PublishError> {
        let prefix = format!("{}/", self.paths.prefix(asset_id)?);
        let objects = self
            .store
            .list_all(&prefix)
            .await
            .map_err(PublishError::List)?;
        Ok(objects.into_iter().map(|o| o.key).collect())
    }

    fn segment_options(&self, file_name: &str) -> PutOptions {
        PutOptions::new(content_type_for(file_name))
            .with_cache_control(self.settings.segment_cache_control.clone())
    }

    fn playlist_options(&self) -> PutOptions {
        PutOptions::new(content_type_for("playlist.m3u8"))
            .with_cache_control(self.settings.playlist_cache_control.clone())
    }

    fn absorb(&self, report: &mut PublishReport, totals: BatchTotals) {
        report.uploaded += totals.uploaded;
        report.bytes_uploaded += totals.bytes;
        report.skipped.extend(totals.skipped);
    }

    /// Upload in fixed-size concurrent batches, pausing between batches.
    async fn upload_batches(&self, items: &[UploadItem]) -> BatchTotals {
        let mut totals = BatchTotals::default();
        let batch_count = items.len().div_ceil(self.settings.batch_size);

        for (index, batch) in items.chunks(self.settings.batch_size).enumerate() {
            let results = join_all(batch.iter().map(|item| self.upload_one(item))).await;
            for (item, result) in batch.iter().zip(results) {
                match result {
                    Ok(bytes) => {
                        totals.uploaded += 1;
                        totals.bytes += bytes;
                    }
                    Err(e) => {
                        warn!(key = %item.key, error = %e, "Upload skipped after retries");
                        totals.skipped.push(item.key.clone());
                    }
                }
            }
            debug!(batch = index + 1, of = batch_count, "Upload batch finished");

            if index + 1 < batch_count && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }
        totals
    }

    /// Upload one object with a per-attempt timeout and exponential backoff.
    async fn upload_one(&self, item: &UploadItem) -> Result<u64, StorageError> {
        let timeout = self.settings.upload_timeout;
        let retry = &self.settings.retry;
        let outcome = retry_async_if(retry, StorageError::is_retryable, |attempt| async move {
            if attempt > 1 {
                debug!(key = %item.key, attempt, "Retrying upload");
            }
            match tokio::time::timeout(
                timeout,
                self.store.put_file(&item.key, &item.path, &item.options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StorageError::upload_failed(format!(
                    "{} timed out after {:?}",
                    item.key, timeout
                ))),
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success(bytes) => Ok(bytes),
            RetryOutcome::Exhausted { error, .. } => Err(error),
        }
    }
}
