//! hls-forge
//!
//! Transcodes a source video into an HLS adaptive-bitrate ladder and publishes
//! it to an S3-compatible object store, resumably and idempotently.

pub mod batch;
pub mod capability;
pub mod catalog;
pub mod coordinator;
pub mod download;
pub mod encode;
pub mod job;
pub mod ladder;
pub mod metrics;
pub mod metrics_server;
pub mod notify;
pub mod paths;
pub mod playlist;
pub mod probe;
pub mod publish;
pub mod retry;
pub mod storage;
pub mod workspace;

pub use hls_forge_config as config;
pub use hls_forge_config::Config;

pub use batch::{resolve_parallelism, BatchItem, BatchRunner};
pub use capability::{detect, detect_with, CapabilityReport, HostProbe, SystemProbe, Vendor};
pub use catalog::{Catalog, CatalogError, CatalogRecord, JsonCatalog};
pub use coordinator::{Coordinator, CoordinatorDeps, JobError, JobErrorKind, JobOutcome};
pub use download::{DownloadError, Downloader, SourceLocation};
pub use encode::{
    check_segment_parity, EncodeError, EncodeSettings, EncodeStrategy, EncoderKind,
    EncoderProcess, FfmpegProcess, RenditionOutput, SegmentEncoder, VerifyPolicy,
};
pub use job::{ConversionJob, JobStatus};
pub use ladder::{plan, Ladder, QualityLevel, Resolution};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, start_system_sampler, JobMetrics,
    MetricsSnapshot, SharedMetrics, SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use notify::{Notifier, NotifyStatus, WebhookPayload};
pub use paths::{AssetPathPolicy, PathError};
pub use playlist::{compose_master, write_master};
pub use probe::{FfprobeAnalyzer, ProbeError, SourceAnalyzer, SourceInfo};
pub use publish::{PublishError, PublishReport, PublishSettings, Publisher};
pub use retry::{retry_async, retry_async_if, RetryConfig, RetryOutcome};
pub use storage::{check_access, MemoryStore, ObjectStore, S3Store, StorageError, StoreCheck};
pub use workspace::{AssetLease, Workspace, WorkspaceError};
