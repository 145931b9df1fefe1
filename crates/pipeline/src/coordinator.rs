//! Job coordinator
//!
//! Runs one conversion job end to end:
//! 1. skip assets the catalog already marks converted
//! 2. take the asset lease and open (or resume) the workspace
//! 3. download the source
//! 4. probe, plan the ladder, encode every rendition not already complete on disk
//! 5. write the master playlist and publish
//! 6. record the outcome in the catalog, clean up, notify the webhook
//!
//! Every stage transition is persisted to the catalog. A failed job leaves its
//! workspace in place; the next run for the same asset resumes from it.

use crate::capability::CapabilityReport;
use crate::catalog::{Catalog, CatalogError, CatalogRecord};
use crate::config::Config;
use crate::download::{DownloadError, Downloader, SourceLocation};
use crate::encode::{
    check_segment_parity, EncodeError, EncodeSettings, EncoderProcess, FfmpegProcess,
    RenditionJob, RenditionOutput, SegmentEncoder, VerifyPolicy,
};
use crate::job::{ConversionJob, JobStatus};
use crate::ladder::plan;
use crate::metrics::SharedMetrics;
use crate::notify::{Notifier, WebhookPayload};
use crate::paths::{AssetPathPolicy, PathError};
use crate::playlist::{write_master, PlaylistError};
use crate::probe::{FfprobeAnalyzer, ProbeError, SourceAnalyzer};
use crate::publish::{PublishError, PublishReport, PublishSettings, Publisher};
use crate::retry::RetryConfig;
use crate::storage::ObjectStore;
use crate::workspace::{AssetLease, Workspace, WorkspaceError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

/// What went wrong inside a stage
#[derive(Debug, Error)]
pub enum JobErrorKind {
    #[error(transparent)]
    Lease(#[from] WorkspaceError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Source analysis failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// A job failure with the stage it happened in
#[derive(Debug, Error)]
#[error("Job {asset_id} failed while {stage}: {source}")]
pub struct JobError {
    pub asset_id: String,
    pub stage: JobStatus,
    pub source: JobErrorKind,
}

impl JobError {
    /// Another process holds the asset lease
    pub fn is_locked(&self) -> bool {
        matches!(self.source, JobErrorKind::Lease(WorkspaceError::Locked { .. }))
    }
}

trait AtStage<T> {
    fn at(self, job: &ConversionJob) -> Result<T, JobError>;
}

impl<T, E: Into<JobErrorKind>> AtStage<T> for Result<T, E> {
    fn at(self, job: &ConversionJob) -> Result<T, JobError> {
        self.map_err(|e| JobError {
            asset_id: job.asset_id.clone(),
            stage: job.status,
            source: e.into(),
        })
    }
}

/// How a job ended when it did not fail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Converted {
        output_path: String,
        renditions: Vec<String>,
        publish: PublishReport,
    },
    AlreadyConverted {
        output_path: Option<String>,
    },
}

/// Collaborators a coordinator runs against
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<dyn Catalog>,
    pub analyzer: Arc<dyn SourceAnalyzer>,
    pub encoder: Arc<dyn EncoderProcess>,
    pub capabilities: CapabilityReport,
    pub metrics: SharedMetrics,
}

impl CoordinatorDeps {
    /// ffprobe and ffmpeg from `config`, with the given store and catalog
    pub fn from_config(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
        capabilities: CapabilityReport,
        metrics: SharedMetrics,
    ) -> Self {
        let encoding = &config.encoding;
        Self {
            store,
            catalog,
            analyzer: Arc::new(FfprobeAnalyzer::new(
                encoding.ffprobe_path.clone(),
                Duration::from_secs(encoding.probe_timeout_secs),
            )),
            encoder: Arc::new(FfmpegProcess::new(
                encoding.ffmpeg_path.clone(),
                Duration::from_secs(encoding.encode_timeout_secs),
            )),
            capabilities,
            metrics,
        }
    }
}

#[derive(Debug, Clone)]
struct CoordinatorSettings {
    workspace_root: PathBuf,
    cleanup_workspace: bool,
    delete_source_after_conversion: bool,
}

struct Published {
    workspace: Workspace,
    master_key: String,
    renditions: Vec<String>,
    report: PublishReport,
}

/// Sequences download, encode and publish for conversion jobs.
///
/// One coordinator is shared by every job of a batch.
pub struct Coordinator {
    store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    analyzer: Arc<dyn SourceAnalyzer>,
    encoder: SegmentEncoder,
    publisher: Publisher,
    downloader: Downloader,
    notifier: Notifier,
    capabilities: CapabilityReport,
    metrics: SharedMetrics,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(config: &Config, deps: CoordinatorDeps) -> Self {
        let encode_settings = EncodeSettings {
            segment_duration_secs: config.encoding.segment_duration_secs,
            verify: VerifyPolicy {
                segment_tolerance: config.encoding.segment_tolerance,
                require_endlist: config.encoding.require_endlist,
            },
        };
        let download_retry = RetryConfig::new("download")
            .with_max_attempts(config.jobs.download_max_attempts)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30));

        let notifier = Notifier::new(&config.webhook);
        if !notifier.is_enabled() {
            debug!("No webhook configured, completion notices disabled");
        }

        Self {
            encoder: SegmentEncoder::new(deps.encoder, encode_settings),
            publisher: Publisher::new(
                deps.store.clone(),
                AssetPathPolicy::new(config.storage.public_root.clone()),
                PublishSettings::from_config(&config.publish),
            ),
            downloader: Downloader::new(
                deps.store.clone(),
                download_retry,
                Duration::from_secs(config.jobs.download_timeout_secs),
            ),
            notifier,
            store: deps.store,
            catalog: deps.catalog,
            analyzer: deps.analyzer,
            capabilities: deps.capabilities,
            metrics: deps.metrics,
            settings: CoordinatorSettings {
                workspace_root: config.jobs.workspace_root.clone(),
                cleanup_workspace: config.jobs.cleanup_workspace,
                delete_source_after_conversion: config.jobs.delete_source_after_conversion,
            },
        }
    }

    pub fn capabilities(&self) -> &CapabilityReport {
        &self.capabilities
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Run `job` to a terminal state.
    pub async fn run(&self, job: ConversionJob) -> Result<JobOutcome, JobError> {
        let span = info_span!("job", asset_id = %job.asset_id);
        self.run_job(job).instrument(span).await
    }

    async fn run_job(&self, mut job: ConversionJob) -> Result<JobOutcome, JobError> {
        AssetPathPolicy::validate_asset_id(&job.asset_id).at(&job)?;

        let existing = self.catalog.get(&job.asset_id).await.at(&job)?;
        if let Some(done) = already_converted(existing.as_ref()) {
            return Ok(done);
        }

        // held until this function returns, after cleanup
        let _lease = AssetLease::acquire(&self.settings.workspace_root, &job.asset_id)
            .await
            .at(&job)?;

        // the previous holder may have finished the asset since the first read
        let existing = self.catalog.get(&job.asset_id).await.at(&job)?;
        if let Some(done) = already_converted(existing.as_ref()) {
            return Ok(done);
        }
        let mut record =
            existing.unwrap_or_else(|| CatalogRecord::new(&job.asset_id, job.source.clone()));
        record.source = job.source.clone();

        let started = Instant::now();
        self.metrics
            .write()
            .await
            .job_started(&job.asset_id, self.capabilities.selected.ffmpeg_name());
        info!(source = %job.source, encoder = %self.capabilities.selected, "Conversion started");

        let published = match self.execute(&mut job, &mut record).await {
            Ok(published) => published,
            Err(e) => return Err(self.finish_failed(&mut job, &mut record, e, started).await),
        };

        let mut completed = record.clone();
        completed.mark_complete(published.master_key.clone());
        if let Err(e) = self.catalog.put(&completed).await {
            let err = JobError {
                asset_id: job.asset_id.clone(),
                stage: job.status,
                source: e.into(),
            };
            return Err(self.finish_failed(&mut job, &mut record, err, started).await);
        }
        job.set_status(JobStatus::Complete);
        {
            let mut metrics = self.metrics.write().await;
            metrics.job_stage(&job.asset_id, JobStatus::Complete.as_str());
            metrics.job_finished(&job.asset_id, None);
        }
        info!(
            output_path = %published.master_key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Conversion complete"
        );

        self.cleanup(published.workspace, &job.source).await;
        self.notifier
            .notify(&WebhookPayload::completed(
                &job.asset_id,
                &published.master_key,
                started.elapsed(),
            ))
            .await;

        Ok(JobOutcome::Converted {
            output_path: published.master_key,
            renditions: published.renditions,
            publish: published.report,
        })
    }

    async fn execute(
        &self,
        job: &mut ConversionJob,
        record: &mut CatalogRecord,
    ) -> Result<Published, JobError> {
        self.enter(job, record, JobStatus::Downloading).await?;
        let workspace = Workspace::open(&self.settings.workspace_root, &job.asset_id)
            .await
            .at(job)?;
        let source_path = workspace.source_path(&job.source.extension());
        self.downloader.fetch(&job.source, &source_path).await.at(job)?;

        self.enter(job, record, JobStatus::Encoding).await?;
        let info = self.analyzer.analyze(&source_path).await.at(job)?;
        let ladder = plan(&info, job.include_lower_rendition);
        info!(
            source = %format!("{}x{}", info.width, info.height),
            bitrate_kbps = info.bitrate_kbps,
            duration_secs = info.duration_secs,
            renditions = ?ladder.levels().iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            "Ladder planned"
        );
        self.metrics
            .write()
            .await
            .job_renditions(&job.asset_id, ladder.len());

        let mut outputs: Vec<RenditionOutput> = Vec::with_capacity(ladder.len());
        for level in ladder.levels() {
            let rendition = RenditionJob::for_level(
                &source_path,
                info.duration_secs,
                info.frame_rate,
                &ladder,
                level,
                workspace.rendition_dir(&level.name),
            );
            // a fresh workspace has nothing to reuse
            let reusable = if workspace.is_reused() {
                self.encoder.existing_output(&rendition).await
            } else {
                None
            };
            let output = match reusable {
                Some(output) => {
                    info!(
                        rendition = %level.name,
                        segments = output.segment_count(),
                        "Reusing rendition from earlier run"
                    );
                    output
                }
                None => self
                    .encoder
                    .encode(&rendition, self.capabilities.selected)
                    .await
                    .at(job)?,
            };
            outputs.push(output);
        }
        check_segment_parity(&outputs).at(job)?;
        let master = write_master(&ladder, &workspace.output_dir()).await.at(job)?;

        self.enter(job, record, JobStatus::Publishing).await?;
        let report = self
            .publisher
            .publish(&job.asset_id, &outputs, &master)
            .await
            .at(job)?;
        self.metrics.write().await.job_uploaded(
            &job.asset_id,
            report.segments_uploaded as u64,
            report.bytes_uploaded,
        );
        let master_key = self.publisher.paths().master_key(&job.asset_id).at(job)?;

        Ok(Published {
            workspace,
            master_key,
            renditions: outputs.into_iter().map(|o| o.name).collect(),
            report,
        })
    }

    /// Move to `status` and persist it
    async fn enter(
        &self,
        job: &mut ConversionJob,
        record: &mut CatalogRecord,
        status: JobStatus,
    ) -> Result<(), JobError> {
        job.set_status(status);
        record.mark_status(status);
        debug!(stage = %status, "Entering stage");
        self.metrics
            .write()
            .await
            .job_stage(&job.asset_id, status.as_str());
        self.catalog.put(record).await.at(job)
    }

    async fn finish_failed(
        &self,
        job: &mut ConversionJob,
        record: &mut CatalogRecord,
        err: JobError,
        started: Instant,
    ) -> JobError {
        let message = err.to_string();
        warn!(stage = %err.stage, error = %message, "Conversion failed, workspace kept for resume");

        job.fail(message.clone());
        record.mark_failed(message.clone());
        if let Err(e) = self.catalog.put(record).await {
            warn!(error = %e, "Failed to record failure in catalog");
        }
        {
            let mut metrics = self.metrics.write().await;
            metrics.job_stage(&job.asset_id, JobStatus::Failed.as_str());
            metrics.job_finished(&job.asset_id, Some(message.clone()));
        }
        self.notifier
            .notify(&WebhookPayload::failed(&job.asset_id, &message, started.elapsed()))
            .await;
        err
    }

    async fn cleanup(&self, workspace: Workspace, source: &SourceLocation) {
        if self.settings.cleanup_workspace {
            let dir = workspace.dir().to_path_buf();
            if let Err(e) = workspace.remove().await {
                warn!(path = %dir.display(), error = %e, "Failed to remove workspace");
            }
        }

        if self.settings.delete_source_after_conversion {
            match source {
                SourceLocation::Object(key) => match self.store.delete(key).await {
                    Ok(()) => info!(key = %key, "Deleted source object"),
                    Err(e) => warn!(key = %key, error = %e, "Failed to delete source object"),
                },
                SourceLocation::Url(_) => {
                    debug!("Source is not a store object, nothing to delete");
                }
            }
        }
    }
}

fn already_converted(record: Option<&CatalogRecord>) -> Option<JobOutcome> {
    let record = record.filter(|r| r.is_converted())?;
    info!(output_path = ?record.output_path, "Asset already converted, nothing to do");
    Some(JobOutcome::AlreadyConverted {
        output_path: record.output_path.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::JsonCatalog;
    use crate::metrics::new_shared_metrics;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Catalog whose asset is completed by another worker right after the
    /// first read.
    struct FinishedElsewhere {
        inner: JsonCatalog,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Catalog for FinishedElsewhere {
        async fn get(&self, asset_id: &str) -> Result<Option<CatalogRecord>, CatalogError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                let first = self.inner.get(asset_id).await?;
                let mut done = CatalogRecord::new(asset_id, SourceLocation::parse("uploads/a1.mp4"));
                done.mark_complete(format!("videos/{}/hls/master.m3u8", asset_id));
                self.inner.put(&done).await?;
                return Ok(first);
            }
            self.inner.get(asset_id).await
        }

        async fn put(&self, record: &CatalogRecord) -> Result<(), CatalogError> {
            self.inner.put(record).await
        }

        async fn list(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
            self.inner.list().await
        }
    }

    fn deps_with(store: Arc<MemoryStore>, catalog: Arc<dyn Catalog>) -> CoordinatorDeps {
        CoordinatorDeps::from_config(
            &Config::default(),
            store,
            catalog,
            CapabilityReport::software_only(),
            new_shared_metrics(),
        )
    }

    #[tokio::test]
    async fn test_converted_asset_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(JsonCatalog::new(tmp.path().join("catalog")));
        let mut record = CatalogRecord::new("a1", SourceLocation::parse("uploads/a1.mp4"));
        record.mark_complete("videos/a1/hls/master.m3u8");
        catalog.put(&record).await.unwrap();

        let mut config = Config::default();
        config.jobs.workspace_root = tmp.path().join("work");
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(&config, deps_with(store.clone(), catalog));

        let outcome = coordinator
            .run(ConversionJob::new("a1", SourceLocation::parse("uploads/a1.mp4"), false))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::AlreadyConverted {
                output_path: Some("videos/a1/hls/master.m3u8".into())
            }
        );
        assert!(!tmp.path().join("work").exists());
        assert_eq!(store.put_attempts(), 0);
    }

    #[tokio::test]
    async fn test_completion_seen_after_lease_is_honoured() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(FinishedElsewhere {
            inner: JsonCatalog::new(tmp.path().join("catalog")),
            reads: AtomicUsize::new(0),
        });
        let mut config = Config::default();
        config.jobs.workspace_root = tmp.path().join("work");
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(&config, deps_with(store.clone(), catalog.clone()));

        let outcome = coordinator
            .run(ConversionJob::new("a1", SourceLocation::parse("uploads/a1.mp4"), false))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::AlreadyConverted {
                output_path: Some("videos/a1/hls/master.m3u8".into())
            }
        );
        assert_eq!(catalog.reads.load(Ordering::SeqCst), 2);
        let record = catalog.get("a1").await.unwrap().unwrap();
        assert!(record.is_converted());
        assert_eq!(store.put_attempts(), 0);
    }

    #[tokio::test]
    async fn test_invalid_asset_id_fails_before_any_work() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(JsonCatalog::new(tmp.path().join("catalog")));
        let coordinator = Coordinator::new(
            &Config::default(),
            deps_with(Arc::new(MemoryStore::new()), catalog),
        );

        let err = coordinator
            .run(ConversionJob::new("../x", SourceLocation::parse("k.mp4"), false))
            .await
            .unwrap_err();
        assert_eq!(err.stage, JobStatus::Pending);
        assert!(matches!(err.source, JobErrorKind::Path(_)));
    }

    #[tokio::test]
    async fn test_lease_conflict_leaves_catalog_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(JsonCatalog::new(tmp.path().join("catalog")));
        let mut config = Config::default();
        config.jobs.workspace_root = tmp.path().join("work");
        let coordinator = Coordinator::new(
            &config,
            deps_with(Arc::new(MemoryStore::new()), catalog.clone()),
        );

        let _held = AssetLease::acquire(&config.jobs.workspace_root, "a1").await.unwrap();
        let err = coordinator
            .run(ConversionJob::new("a1", SourceLocation::parse("k.mp4"), false))
            .await
            .unwrap_err();
        assert!(err.is_locked());
        assert!(catalog.get("a1").await.unwrap().is_none());
    }
}
