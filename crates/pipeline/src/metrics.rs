//! Batch progress counters
//!
//! One snapshot is shared by every job of a batch and served as JSON by the
//! metrics server.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job progress through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub asset_id: String,
    pub stage: String,
    pub encoder: String,
    pub renditions: usize,
    pub segments_uploaded: u64,
    pub bytes_uploaded: u64,
    pub started_at_unix_ms: i64,
    pub error: Option<String>,
}

/// Host load sampled while encoding
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Everything the metrics endpoint reports
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub segments_uploaded: u64,
    pub bytes_uploaded: u64,
}

pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

impl MetricsSnapshot {
    fn job_mut(&mut self, asset_id: &str) -> &mut JobMetrics {
        let index = match self.jobs.iter().position(|j| j.asset_id == asset_id) {
            Some(index) => index,
            None => {
                self.jobs.push(JobMetrics {
                    asset_id: asset_id.to_string(),
                    stage: String::new(),
                    encoder: String::new(),
                    renditions: 0,
                    segments_uploaded: 0,
                    bytes_uploaded: 0,
                    started_at_unix_ms: crate::job::current_timestamp_ms(),
                    error: None,
                });
                self.jobs.len() - 1
            }
        };
        &mut self.jobs[index]
    }

    /// A job left the queue and started running
    pub fn job_started(&mut self, asset_id: &str, encoder: &str) {
        self.queued = self.queued.saturating_sub(1);
        self.running += 1;
        let job = self.job_mut(asset_id);
        job.encoder = encoder.to_string();
        job.started_at_unix_ms = crate::job::current_timestamp_ms();
        job.error = None;
    }

    pub fn job_stage(&mut self, asset_id: &str, stage: &str) {
        self.job_mut(asset_id).stage = stage.to_string();
    }

    pub fn job_renditions(&mut self, asset_id: &str, renditions: usize) {
        self.job_mut(asset_id).renditions = renditions;
    }

    pub fn job_uploaded(&mut self, asset_id: &str, segments: u64, bytes: u64) {
        self.segments_uploaded += segments;
        self.bytes_uploaded += bytes;
        let job = self.job_mut(asset_id);
        job.segments_uploaded += segments;
        job.bytes_uploaded += bytes;
    }

    pub fn job_finished(&mut self, asset_id: &str, error: Option<String>) {
        self.running = self.running.saturating_sub(1);
        if error.is_some() {
            self.failed += 1;
        } else {
            self.completed += 1;
        }
        self.job_mut(asset_id).error = error;
    }
}

/// Sample CPU, memory and load average
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Refresh system metrics and the snapshot timestamp every `interval`
pub fn start_system_sampler(
    metrics: SharedMetrics,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let system = collect_system_metrics();
            let mut snapshot = metrics.write().await;
            snapshot.system = system;
            snapshot.timestamp_unix_ms = crate::job::current_timestamp_ms();
        }
    })
}
