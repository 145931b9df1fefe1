//! Source analysis via ffprobe.
//!
//! Probes the downloaded source file for the dimensions, bitrate, duration and
//! audio presence the ladder planner needs. Any failure here is fatal for the
//! job: a ladder cannot be planned without them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Error type for source analysis.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe did not finish in time.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Output parsed but is unusable for planning.
    #[error("Unusable source: {0}")]
    Unusable(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the planner needs to know about a source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Video bitrate in kbps; container or size-derived when the stream has none.
    pub bitrate_kbps: u32,
    pub duration_secs: f64,
    pub video_codec: String,
    pub frame_rate: Option<f64>,
    pub has_audio: bool,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub r_frame_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Seam between the coordinator and ffprobe.
#[async_trait]
pub trait SourceAnalyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<SourceInfo, ProbeError>;
}

/// Runs the real ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeAnalyzer {
    pub ffprobe_path: PathBuf,
    pub timeout: Duration,
}

impl FfprobeAnalyzer {
    pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SourceAnalyzer for FfprobeAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<SourceInfo, ProbeError> {
        probe_source(&self.ffprobe_path, path, self.timeout).await
    }
}

/// Probes a video file using ffprobe.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
/// and parses the JSON output.
pub async fn probe_source(
    ffprobe: &Path,
    path: &Path,
    timeout: Duration,
) -> Result<SourceInfo, ProbeError> {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path)
    .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a SourceInfo.
pub fn parse_ffprobe_output(json_str: &str) -> Result<SourceInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::Unusable("no video stream".to_string()))?;
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let width = video.width.unwrap_or(0);
    let height = video.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(ProbeError::Unusable(format!(
            "video stream has no dimensions ({}x{})",
            width, height
        )));
    }

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    if duration_secs.is_nan() || duration_secs <= 0.0 {
        return Err(ProbeError::Unusable("duration is unknown or zero".to_string()));
    }

    let size_bytes = format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let bitrate_bps = parse_bps(video.bit_rate.as_deref())
        .or_else(|| parse_bps(format.bit_rate.as_deref()))
        .unwrap_or_else(|| size_bytes as f64 * 8.0 / duration_secs);

    Ok(SourceInfo {
        width,
        height,
        bitrate_kbps: (bitrate_bps / 1000.0).round() as u32,
        duration_secs,
        video_codec: video.codec_name.clone().unwrap_or_default(),
        frame_rate: video.r_frame_rate.as_deref().and_then(parse_frame_rate),
        has_audio,
    })
}

fn parse_bps(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|bps| *bps > 0.0)
}

/// Parse an ffprobe rational like "30000/1001" or a plain number.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let fps = match value.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse::<f64>().ok()?,
    };
    (fps > 0.0 && fps.is_finite()).then_some(fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "bit_rate": "5000000", "r_frame_rate": "30000/1001"},
            {"codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"duration": "7200.000000", "size": "4500000000", "bit_rate": "5192000"}
    }"#;

    #[test]
    fn test_parse_full_output() {
        let info = parse_ffprobe_output(FULL).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.bitrate_kbps, 5000);
        assert_eq!(info.video_codec, "h264");
        assert!(info.has_audio);
        assert!((info.duration_secs - 7200.0).abs() < f64::EPSILON);
        let fps = info.frame_rate.unwrap();
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_bitrate_falls_back_to_container() {
        let json = r#"{
            "streams": [{"codec_type": "video", "codec_name": "hevc", "width": 1280, "height": 720}],
            "format": {"duration": "60", "size": "1000", "bit_rate": "3000000"}
        }"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!(info.bitrate_kbps, 3000);
        assert!(!info.has_audio);
    }

    #[test]
    fn test_bitrate_falls_back_to_size_over_duration() {
        // 7.5 MB over 10 s = 6 Mbps
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 360, "bit_rate": "N/A"}],
            "format": {"duration": "10", "size": "7500000"}
        }"#;
        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!(info.bitrate_kbps, 6000);
    }

    #[test]
    fn test_missing_video_stream_is_unusable() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "10"}}"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::Unusable(_))
        ));
    }

    #[test]
    fn test_zero_duration_is_unusable() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 360}],
            "format": {"duration": "0"}
        }"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::Unusable(_))
        ));
    }

    #[test]
    fn test_missing_format_is_parse_error() {
        let json = r#"{"streams": []}"#;
        assert!(matches!(
            parse_ffprobe_output(json),
            Err(ProbeError::ParseError(_))
        ));
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let result = probe_source(
            Path::new("/nonexistent/ffprobe-binary"),
            Path::new("/tmp/whatever.mp4"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }
}
