//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is present but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Remote object store (S3 / R2 compatible) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// S3 API endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// Root under which every asset prefix is placed
    #[serde(default = "default_public_root")]
    pub public_root: String,
    #[serde(default = "default_true")]
    pub force_path_style: bool,
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_public_root() -> String {
    "videos".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            bucket: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            public_root: default_public_root(),
            force_path_style: true,
        }
    }
}

/// Encoder and ladder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    /// Allow hardware-accelerated encoders (default true)
    #[serde(default = "default_true")]
    pub gpu_enabled: bool,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Nominal HLS segment duration in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
    /// Add the fixed 480p rendition when the source is larger
    #[serde(default)]
    pub include_lower_rendition: bool,
    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// How many segments short of the expected count a non-zero exit may leave
    /// before the output is rejected
    #[serde(default = "default_segment_tolerance")]
    pub segment_tolerance: u32,
    #[serde(default = "default_true")]
    pub require_endlist: bool,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_segment_duration_secs() -> u32 {
    6
}

fn default_encode_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_segment_tolerance() -> u32 {
    1
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            gpu_enabled: true,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            segment_duration_secs: default_segment_duration_secs(),
            include_lower_rendition: false,
            encode_timeout_secs: default_encode_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            segment_tolerance: default_segment_tolerance(),
            require_endlist: true,
        }
    }
}

/// Publisher tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Objects uploaded concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches in milliseconds
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Upload attempts per object, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_segment_cache_control")]
    pub segment_cache_control: String,
    #[serde(default = "default_playlist_cache_control")]
    pub playlist_cache_control: String,
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_upload_timeout_secs() -> u64 {
    60
}

fn default_segment_cache_control() -> String {
    "public, max-age=31536000, immutable".to_string()
}

fn default_playlist_cache_control() -> String {
    "public, max-age=60".to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            upload_timeout_secs: default_upload_timeout_secs(),
            segment_cache_control: default_segment_cache_control(),
            playlist_cache_control: default_playlist_cache_control(),
        }
    }
}

/// Job and batch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Root directory for per-job temp workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Directory holding the JSON catalog records
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,
    /// Concurrent jobs per batch (0 = auto-derive)
    #[serde(default = "default_parallel_jobs")]
    pub parallel_jobs: u32,
    /// Upper bound for `parallel_jobs`
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: u32,
    /// Delete the temp workspace after a successful job
    #[serde(default = "default_true")]
    pub cleanup_workspace: bool,
    /// Delete the source object from the store after a successful job
    #[serde(default)]
    pub delete_source_after_conversion: bool,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_download_max_attempts")]
    pub download_max_attempts: u32,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/tmp/hls-forge")
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("/var/lib/hls-forge/catalog")
}

fn default_parallel_jobs() -> u32 {
    2
}

fn default_max_parallel_jobs() -> u32 {
    4
}

fn default_download_timeout_secs() -> u64 {
    60 * 60
}

fn default_download_max_attempts() -> u32 {
    4
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            catalog_dir: default_catalog_dir(),
            parallel_jobs: default_parallel_jobs(),
            max_parallel_jobs: default_max_parallel_jobs(),
            cleanup_workspace: true,
            delete_source_after_conversion: false,
            download_timeout_secs: default_download_timeout_secs(),
            download_max_attempts: default_download_max_attempts(),
        }
    }
}

/// Completion webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    /// Endpoint receiving terminal job notifications (disabled when unset)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

/// Progress endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - STORAGE_ENDPOINT_URL, STORAGE_BUCKET, STORAGE_REGION,
    ///   STORAGE_ACCESS_KEY_ID, STORAGE_SECRET_ACCESS_KEY -> storage.*
    /// - ENCODING_GPU_ENABLED -> encoding.gpu_enabled
    /// - ENCODING_INCLUDE_LOWER_RENDITION -> encoding.include_lower_rendition
    /// - ENCODING_SEGMENT_DURATION_SECS -> encoding.segment_duration_secs
    /// - PUBLISH_BATCH_SIZE -> publish.batch_size
    /// - PUBLISH_MAX_ATTEMPTS -> publish.max_attempts
    /// - JOBS_PARALLEL -> jobs.parallel_jobs
    /// - JOBS_WORKSPACE_ROOT -> jobs.workspace_root
    /// - JOBS_DELETE_SOURCE -> jobs.delete_source_after_conversion
    /// - WEBHOOK_URL -> webhook.url
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STORAGE_ENDPOINT_URL") {
            self.storage.endpoint_url = val;
        }
        if let Ok(val) = env::var("STORAGE_BUCKET") {
            self.storage.bucket = val;
        }
        if let Ok(val) = env::var("STORAGE_REGION") {
            self.storage.region = val;
        }
        if let Ok(val) = env::var("STORAGE_ACCESS_KEY_ID") {
            self.storage.access_key_id = val;
        }
        if let Ok(val) = env::var("STORAGE_SECRET_ACCESS_KEY") {
            self.storage.secret_access_key = val;
        }

        if let Some(enabled) = env_bool("ENCODING_GPU_ENABLED") {
            self.encoding.gpu_enabled = enabled;
        }
        if let Some(include) = env_bool("ENCODING_INCLUDE_LOWER_RENDITION") {
            self.encoding.include_lower_rendition = include;
        }
        if let Ok(val) = env::var("ENCODING_SEGMENT_DURATION_SECS") {
            if let Ok(secs) = val.parse::<u32>() {
                self.encoding.segment_duration_secs = secs;
            }
        }

        if let Ok(val) = env::var("PUBLISH_BATCH_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                self.publish.batch_size = size;
            }
        }
        if let Ok(val) = env::var("PUBLISH_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.publish.max_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("JOBS_PARALLEL") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.parallel_jobs = jobs;
            }
        }
        if let Ok(val) = env::var("JOBS_WORKSPACE_ROOT") {
            if !val.is_empty() {
                self.jobs.workspace_root = PathBuf::from(val);
            }
        }
        if let Some(delete) = env_bool("JOBS_DELETE_SOURCE") {
            self.jobs.delete_source_after_conversion = delete;
        }

        if let Ok(val) = env::var("WEBHOOK_URL") {
            self.webhook.url = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Reject values the pipeline cannot run with
    ///
    /// `needs_store` is false for dry runs, which never talk to the remote store.
    pub fn validate(&self, needs_store: bool) -> Result<(), ConfigError> {
        if needs_store && self.storage.bucket.is_empty() {
            return Err(ConfigError::Invalid("storage.bucket is required".to_string()));
        }
        if needs_store && self.storage.endpoint_url.is_empty() {
            return Err(ConfigError::Invalid(
                "storage.endpoint_url is required".to_string(),
            ));
        }
        if needs_store
            && (self.storage.access_key_id.is_empty() || self.storage.secret_access_key.is_empty())
        {
            return Err(ConfigError::Invalid(
                "storage.access_key_id and storage.secret_access_key are required".to_string(),
            ));
        }
        if self.publish.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "publish.batch_size must be at least 1".to_string(),
            ));
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "publish.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.encoding.segment_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "encoding.segment_duration_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_bool(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
