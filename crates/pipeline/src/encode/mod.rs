//! Segment encoding
//!
//! Turns one ladder level into a verified directory of HLS segments, trying
//! progressively more conservative strategies until one produces usable output.

pub mod ffmpeg;
pub mod strategy;
pub mod verify;

pub use ffmpeg::{
    build_encode_args, build_invocation, level_for_height, EncodeInvocation, EncoderProcess,
    FfmpegProcess, ProcessExit, RenditionTarget,
};
pub use strategy::{
    attempt_plan, is_hardware_failure, EncodeAttempt, EncodeStrategy, EncoderKind,
};
pub use verify::{required_segments, verify_rendition, RenditionOutput, VerifyError, VerifyPolicy};

use crate::ladder::{Ladder, QualityLevel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Every strategy for a rendition failed
    #[error("All {} strategies failed for rendition {rendition}: {}", .failures.len(), summarize(.failures))]
    StrategiesExhausted {
        rendition: String,
        failures: Vec<AttemptFailure>,
    },

    /// Renditions disagree on segment count by more than one
    #[error("Segment counts diverge across renditions: {counts:?}")]
    SegmentParity { counts: Vec<(String, usize)> },

    /// The encoder did not finish in time
    #[error("Encoder timed out after {0:?}")]
    Timeout(Duration),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why one attempt was rejected
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub encoder: EncoderKind,
    pub strategy: &'static str,
    pub reason: String,
}

fn summarize(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}/{}: {}", f.encoder, f.strategy, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-job encoding parameters
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub segment_duration_secs: u32,
    pub verify: VerifyPolicy,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            segment_duration_secs: 6,
            verify: VerifyPolicy::default(),
        }
    }
}

/// Where and what to encode for one rendition
#[derive(Debug, Clone)]
pub struct RenditionJob<'a> {
    pub source: &'a Path,
    pub duration_secs: f64,
    pub target: RenditionTarget,
    pub output_dir: PathBuf,
}

impl<'a> RenditionJob<'a> {
    /// Describe `level` of `ladder` for encoding into `output_dir`
    pub fn for_level(
        source: &'a Path,
        duration_secs: f64,
        frame_rate: Option<f64>,
        ladder: &Ladder,
        level: &QualityLevel,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            duration_secs,
            target: RenditionTarget {
                name: level.name.clone(),
                scale_to: level.resolution,
                output_height: ladder.output_resolution(level).height,
                video_bitrate_kbps: level.video_bitrate_kbps,
                max_bitrate_kbps: level.max_bitrate_kbps,
                buffer_size_kbps: level.buffer_size_kbps,
                audio_bitrate_kbps: level.audio_bitrate_kbps,
                frame_rate,
            },
            output_dir,
        }
    }
}

/// Encodes renditions with strategy fallback and output verification.
#[derive(Clone)]
pub struct SegmentEncoder {
    process: Arc<dyn EncoderProcess>,
    settings: EncodeSettings,
}

impl SegmentEncoder {
    pub fn new(process: Arc<dyn EncoderProcess>, settings: EncodeSettings) -> Self {
        Self { process, settings }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    /// Reuse a rendition left complete by an earlier run, if there is one
    pub async fn existing_output(&self, job: &RenditionJob<'_>) -> Option<RenditionOutput> {
        verify_rendition(
            &job.target.name,
            &job.output_dir,
            job.duration_secs,
            self.settings.segment_duration_secs,
            &self.settings.verify,
        )
        .await
        .ok()
    }

    /// Encode one rendition with `preferred`, falling back through the attempt plan.
    pub async fn encode(
        &self,
        job: &RenditionJob<'_>,
        preferred: EncoderKind,
    ) -> Result<RenditionOutput, EncodeError> {
        let name = job.target.name.as_str();
        let mut failures = Vec::new();
        let mut hardware_broken = false;

        for attempt in attempt_plan(preferred) {
            if hardware_broken && attempt.kind.is_hardware() {
                continue;
            }

            reset_dir(&job.output_dir).await?;
            let invocation = build_invocation(
                job.source,
                &job.output_dir,
                &job.target,
                self.settings.segment_duration_secs,
                &attempt,
            );

            info!(
                rendition = name,
                encoder = %attempt.kind,
                strategy = attempt.strategy.name(),
                "Encoding rendition"
            );

            let exit = match self.process.run(&invocation).await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(rendition = name, strategy = attempt.strategy.name(), error = %e, "Encoder did not run to completion");
                    failures.push(AttemptFailure {
                        encoder: attempt.kind,
                        strategy: attempt.strategy.name(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let verified = verify_rendition(
                name,
                &job.output_dir,
                job.duration_secs,
                self.settings.segment_duration_secs,
                &self.settings.verify,
            )
            .await;

            match verified {
                Ok(output) => {
                    if !exit.success() {
                        warn!(
                            rendition = name,
                            strategy = attempt.strategy.name(),
                            code = ?exit.code,
                            segments = output.segment_count(),
                            "Encoder reported failure but output verified, accepting"
                        );
                    }
                    info!(
                        rendition = name,
                        strategy = attempt.strategy.name(),
                        segments = output.segment_count(),
                        "Rendition encoded"
                    );
                    return Ok(output);
                }
                Err(verify_err) => {
                    let reason = if exit.success() {
                        format!("exited 0 but output is invalid: {}", verify_err)
                    } else {
                        format!(
                            "exit code {:?}, {}: {}",
                            exit.code,
                            verify_err,
                            last_line(&exit.stderr_tail)
                        )
                    };
                    warn!(rendition = name, strategy = attempt.strategy.name(), reason = %reason, "Strategy failed");

                    if attempt.kind.is_hardware() && is_hardware_failure(&exit.stderr_tail) {
                        warn!(rendition = name, encoder = %attempt.kind, "Hardware encoder unusable, skipping to software");
                        hardware_broken = true;
                    }
                    failures.push(AttemptFailure {
                        encoder: attempt.kind,
                        strategy: attempt.strategy.name(),
                        reason,
                    });
                }
            }
        }

        Err(EncodeError::StrategiesExhausted {
            rendition: name.to_string(),
            failures,
        })
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or("")
}

/// Remove partial output from a previous attempt and recreate the directory
async fn reset_dir(dir: &Path) -> Result<(), EncodeError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Renditions of one ladder must agree on segment count within one
pub fn check_segment_parity(outputs: &[RenditionOutput]) -> Result<(), EncodeError> {
    let counts: Vec<usize> = outputs.iter().map(|o| o.segment_count()).collect();
    let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) else {
        return Ok(());
    };
    if max - min > 1 {
        return Err(EncodeError::SegmentParity {
            counts: outputs
                .iter()
                .map(|o| (o.name.clone(), o.segment_count()))
                .collect(),
        });
    }
    Ok(())
}
