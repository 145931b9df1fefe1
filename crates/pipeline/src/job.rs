//! Conversion job lifecycle.

use crate::download::SourceLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a conversion job is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Requested, not started.
    #[default]
    Pending,
    /// Fetching the source into the workspace.
    Downloading,
    /// Probing, planning and encoding renditions.
    Encoding,
    /// Uploading renditions and playlists.
    Publishing,
    /// Published and recorded.
    Complete,
    /// Stopped with an error; the workspace is kept for the next run.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Encoding => "encoding",
            JobStatus::Publishing => "publishing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One requested conversion, identified by its asset id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub asset_id: String,
    pub source: SourceLocation,
    /// Add the fixed lower rendition when the source is taller than it
    pub include_lower_rendition: bool,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversionJob {
    pub fn new(asset_id: impl Into<String>, source: SourceLocation, include_lower_rendition: bool) -> Self {
        let now = current_timestamp_ms();
        Self {
            asset_id: asset_id.into(),
            source,
            include_lower_rendition,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = current_timestamp_ms();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.set_status(JobStatus::Failed);
    }
}
