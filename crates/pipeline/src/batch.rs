//! Batch runner
//!
//! Converts independent assets concurrently, bounded by a semaphore. Every job
//! in a batch shares one coordinator, and with it one store client and one
//! capability report.

use crate::config::JobsConfig;
use crate::coordinator::{Coordinator, JobError, JobOutcome};
use crate::job::ConversionJob;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Concurrent jobs for a host with `cores` logical cores.
///
/// - 1 job below 8 cores
/// - 2 jobs below 16 cores
/// - 4 jobs otherwise
fn derive_parallel_jobs(cores: u32) -> u32 {
    match cores {
        0..=7 => 1,
        8..=15 => 2,
        _ => 4,
    }
}

/// Jobs to run at once: the configured value, or derived from the core count
/// when zero, clamped to `[1, max_parallel_jobs]`.
pub fn resolve_parallelism(cfg: &JobsConfig) -> usize {
    let requested = if cfg.parallel_jobs > 0 {
        cfg.parallel_jobs
    } else {
        derive_parallel_jobs(num_cpus::get() as u32)
    };
    requested.clamp(1, cfg.max_parallel_jobs.max(1)) as usize
}

/// Result for one asset of a batch
#[derive(Debug)]
pub struct BatchItem {
    pub asset_id: String,
    pub result: Result<JobOutcome, JobError>,
}

impl BatchItem {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

/// Drop repeated asset ids, keeping the first request for each
pub fn dedup_jobs(jobs: Vec<ConversionJob>) -> Vec<ConversionJob> {
    let mut seen = HashSet::new();
    jobs.into_iter()
        .filter(|job| {
            let fresh = seen.insert(job.asset_id.clone());
            if !fresh {
                warn!(asset_id = %job.asset_id, "Duplicate asset in batch, ignoring");
            }
            fresh
        })
        .collect()
}

pub struct BatchRunner {
    coordinator: Arc<Coordinator>,
    parallelism: usize,
}

impl BatchRunner {
    pub fn new(coordinator: Arc<Coordinator>, parallelism: usize) -> Self {
        Self {
            coordinator,
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run every job, at most `parallelism` at a time, in request order of results.
    pub async fn run(&self, jobs: Vec<ConversionJob>) -> Vec<BatchItem> {
        let jobs = dedup_jobs(jobs);
        let metrics = self.coordinator.metrics();
        metrics.write().await.queued += jobs.len();
        info!(jobs = jobs.len(), parallelism = self.parallelism, "Starting batch");

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let runs = jobs.into_iter().map(|job| {
            let semaphore = semaphore.clone();
            let coordinator = self.coordinator.clone();
            async move {
                // the semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                let asset_id = job.asset_id.clone();
                let result = coordinator.run(job).await;
                BatchItem { asset_id, result }
            }
        });
        let items = join_all(runs).await;

        let failed = items.iter().filter(|i| i.is_failure()).count();
        info!(
            total = items.len(),
            failed,
            "Batch finished"
        );
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::SourceLocation;
    use proptest::prelude::*;

    #[test]
    fn test_dedup_keeps_first() {
        let jobs = vec![
            ConversionJob::new("a", SourceLocation::parse("a1.mp4"), false),
            ConversionJob::new("b", SourceLocation::parse("b.mp4"), false),
            ConversionJob::new("a", SourceLocation::parse("a2.mp4"), false),
        ];
        let deduped = dedup_jobs(jobs);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].source.as_str(), "a1.mp4");
        assert_eq!(deduped[1].asset_id, "b");
    }

    #[test]
    fn test_explicit_parallelism_is_clamped() {
        let cfg = JobsConfig {
            parallel_jobs: 10,
            max_parallel_jobs: 3,
            ..JobsConfig::default()
        };
        assert_eq!(resolve_parallelism(&cfg), 3);

        let cfg = JobsConfig {
            parallel_jobs: 2,
            max_parallel_jobs: 0,
            ..JobsConfig::default()
        };
        assert_eq!(resolve_parallelism(&cfg), 1);
    }

    proptest! {
        #[test]
        fn prop_auto_parallelism_within_bounds(max in 1u32..16) {
            let cfg = JobsConfig {
                parallel_jobs: 0,
                max_parallel_jobs: max,
                ..JobsConfig::default()
            };
            let n = resolve_parallelism(&cfg);
            prop_assert!(n >= 1);
            prop_assert!(n <= max as usize);
        }

        #[test]
        fn prop_derived_jobs_monotonic(cores in 0u32..256) {
            prop_assert!(derive_parallel_jobs(cores) <= derive_parallel_jobs(cores + 1));
        }
    }
}
