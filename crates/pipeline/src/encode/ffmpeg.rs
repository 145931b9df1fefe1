//! ffmpeg invocation for HLS rendition encodes
//!
//! Builds the argument list for one (encoder, strategy) attempt and runs it
//! as a subprocess behind the [`EncoderProcess`] trait.

use super::strategy::{EncodeAttempt, EncodeStrategy, EncoderKind};
use super::EncodeError;
use crate::ladder::Resolution;
use crate::paths::RENDITION_PLAYLIST;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Render node used for VA-API on Linux
pub const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Frame rate assumed when the source does not report one
const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Everything about one rendition that shapes the ffmpeg command
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionTarget {
    pub name: String,
    /// Output size when scaling; `None` keeps the source size
    pub scale_to: Option<Resolution>,
    /// Height used for level selection
    pub output_height: u32,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    pub audio_bitrate_kbps: Option<u32>,
    pub frame_rate: Option<f64>,
}

/// A fully-built encoder run, as handed to an [`EncoderProcess`]
#[derive(Debug, Clone)]
pub struct EncodeInvocation {
    pub attempt: EncodeAttempt,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
}

/// How the encoder process ended
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessExit {
    /// `None` when killed by a signal
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs an encode invocation to completion.
#[async_trait]
pub trait EncoderProcess: Send + Sync {
    async fn run(&self, invocation: &EncodeInvocation) -> Result<ProcessExit, EncodeError>;
}

/// Runs the real ffmpeg binary with a hard timeout.
#[derive(Debug, Clone)]
pub struct FfmpegProcess {
    pub ffmpeg_path: PathBuf,
    pub timeout: Duration,
}

impl FfmpegProcess {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    async fn run(&self, invocation: &EncodeInvocation) -> Result<ProcessExit, EncodeError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child.stderr.take();
        let collect_tail = async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "ffmpeg", "{}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        };

        let run = async { tokio::join!(child.wait(), collect_tail) };
        let (status, stderr_tail) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| EncodeError::Timeout(self.timeout))?;
        let status = status?;

        Ok(ProcessExit {
            code: status.code(),
            stderr_tail,
        })
    }
}

/// H.264 level large enough for `height` at common frame rates
pub fn level_for_height(height: u32) -> &'static str {
    match height {
        0..=576 => "3.1",
        577..=1088 => "4.1",
        1089..=1600 => "5.0",
        _ => "5.1",
    }
}

/// GOP length in frames for a keyframe every `secs` seconds
fn gop_frames(frame_rate: Option<f64>, secs: u32) -> u32 {
    let fps = frame_rate
        .filter(|f| f.is_finite() && *f > 0.0)
        .unwrap_or(DEFAULT_FRAME_RATE);
    ((fps * f64::from(secs)).round() as u32).max(1)
}

fn push(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Input-side hardware acceleration flags
fn hwaccel_args(kind: EncoderKind, args: &mut Vec<String>) {
    match kind {
        EncoderKind::Nvenc => {
            push(args, "-hwaccel", "cuda");
            push(args, "-hwaccel_output_format", "cuda");
        }
        EncoderKind::Qsv => {
            push(args, "-hwaccel", "qsv");
            push(args, "-hwaccel_output_format", "qsv");
        }
        EncoderKind::Vaapi => {
            push(args, "-hwaccel", "vaapi");
            push(args, "-hwaccel_output_format", "vaapi");
            push(args, "-vaapi_device", VAAPI_DEVICE);
        }
        EncoderKind::VideoToolbox => {
            push(args, "-hwaccel", "videotoolbox");
        }
        EncoderKind::Amf | EncoderKind::Libx264 => {}
    }
}

/// Scaling filter and pixel format for frames living on `kind`'s device
fn video_filter_args(kind: EncoderKind, scale_to: Option<Resolution>, args: &mut Vec<String>) {
    let filter = match (kind, scale_to) {
        (EncoderKind::Nvenc, Some(r)) => Some(format!("scale_cuda={}:{}", r.width, r.height)),
        (EncoderKind::Qsv, Some(r)) => Some(format!("vpp_qsv=w={}:h={}", r.width, r.height)),
        (EncoderKind::Vaapi, Some(r)) => Some(format!("scale_vaapi=w={}:h={}", r.width, r.height)),
        (_, Some(r)) => Some(format!("scale={}:{}", r.width, r.height)),
        (_, None) => None,
    };
    if let Some(filter) = filter {
        push(args, "-vf", filter);
    }
    // device frames keep their own surface format
    if matches!(
        kind,
        EncoderKind::Libx264 | EncoderKind::Amf | EncoderKind::VideoToolbox
    ) {
        push(args, "-pix_fmt", "yuv420p");
    }
}

/// Build the ffmpeg arguments for one attempt at encoding `target`.
///
/// Segment boundaries are pinned with `-force_key_frames` at multiples of the
/// segment duration so every rendition of a ladder cuts at the same
/// timestamps, whatever GOP the strategy picks.
pub fn build_encode_args(
    input: &Path,
    output_dir: &Path,
    target: &RenditionTarget,
    segment_duration_secs: u32,
    attempt: &EncodeAttempt,
) -> Vec<String> {
    let kind = attempt.kind;
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    hwaccel_args(kind, &mut args);
    push(&mut args, "-i", input.to_string_lossy());

    push(&mut args, "-map", "0:v:0");
    if target.audio_bitrate_kbps.is_some() {
        push(&mut args, "-map", "0:a:0");
    }

    push(&mut args, "-c:v", kind.ffmpeg_name());
    video_filter_args(kind, target.scale_to, &mut args);

    let (effort, profile, level, gop_secs, b_frames, bitrate_percent) = match &attempt.strategy {
        EncodeStrategy::Optimal(a) => (
            a.effort,
            a.profile,
            None,
            segment_duration_secs,
            Some(a.b_frames),
            100,
        ),
        EncodeStrategy::Compatible(a) => (
            a.effort,
            a.profile,
            Some(level_for_height(target.output_height)),
            a.keyframe_interval_secs.min(segment_duration_secs).max(1),
            Some(a.b_frames),
            100,
        ),
        EncodeStrategy::Fallback(a) => (
            a.effort,
            a.profile,
            Some(level_for_height(target.output_height)),
            a.keyframe_interval_secs.min(segment_duration_secs).max(1),
            None,
            a.bitrate_percent.clamp(1, 100),
        ),
    };

    if let Some((flag, value)) = effort.preset_args(kind) {
        push(&mut args, flag, value);
    }
    push(&mut args, "-profile:v", profile.as_arg(kind));
    if let Some(level) = level {
        push(&mut args, "-level:v", level);
    }
    if let Some(b_frames) = b_frames {
        push(&mut args, "-bf", b_frames.to_string());
    }

    let scaled = |kbps: u32| format!("{}k", u64::from(kbps) * u64::from(bitrate_percent) / 100);
    push(&mut args, "-b:v", scaled(target.video_bitrate_kbps));
    push(&mut args, "-maxrate", scaled(target.max_bitrate_kbps));
    push(&mut args, "-bufsize", scaled(target.buffer_size_kbps));

    let gop = gop_frames(target.frame_rate, gop_secs).to_string();
    push(&mut args, "-g", gop.clone());
    push(&mut args, "-keyint_min", gop);
    if kind == EncoderKind::Libx264 {
        push(&mut args, "-sc_threshold", "0");
    }
    push(
        &mut args,
        "-force_key_frames",
        format!("expr:gte(t,n_forced*{})", segment_duration_secs),
    );

    match target.audio_bitrate_kbps {
        Some(kbps) => {
            push(&mut args, "-c:a", "aac");
            push(&mut args, "-b:a", format!("{}k", kbps));
            push(&mut args, "-ac", "2");
        }
        None => args.push("-an".to_string()),
    }
    args.push("-sn".to_string());

    push(&mut args, "-f", "hls");
    push(&mut args, "-hls_time", segment_duration_secs.to_string());
    push(&mut args, "-hls_list_size", "0");
    push(&mut args, "-hls_playlist_type", "vod");
    push(&mut args, "-hls_segment_type", "mpegts");
    push(&mut args, "-start_number", "0");
    push(
        &mut args,
        "-hls_segment_filename",
        output_dir.join("segment_%03d.ts").to_string_lossy(),
    );
    args.push(output_dir.join(RENDITION_PLAYLIST).to_string_lossy().into_owned());

    args
}

/// Build a complete invocation for `attempt`
pub fn build_invocation(
    input: &Path,
    output_dir: &Path,
    target: &RenditionTarget,
    segment_duration_secs: u32,
    attempt: &EncodeAttempt,
) -> EncodeInvocation {
    EncodeInvocation {
        attempt: attempt.clone(),
        args: build_encode_args(input, output_dir, target, segment_duration_secs, attempt),
        output_dir: output_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::strategy::attempt_plan;
    use proptest::prelude::*;

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    /// Helper to check if args contain a standalone flag
    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.windows(2)
            .find(|pair| pair[0] == flag)
            .map(|pair| pair[1].as_str())
    }

    fn target(scale_to: Option<Resolution>, audio: Option<u32>) -> RenditionTarget {
        RenditionTarget {
            name: "480p".into(),
            scale_to,
            output_height: scale_to.map(|r| r.height).unwrap_or(1080),
            video_bitrate_kbps: 1400,
            max_bitrate_kbps: 2100,
            buffer_size_kbps: 2800,
            audio_bitrate_kbps: audio,
            frame_rate: Some(25.0),
        }
    }

    fn kind_strategy() -> impl Strategy<Value = EncodeAttempt> {
        prop::sample::select(vec![
            EncoderKind::Libx264,
            EncoderKind::Nvenc,
            EncoderKind::Qsv,
            EncoderKind::Amf,
            EncoderKind::Vaapi,
            EncoderKind::VideoToolbox,
        ])
        .prop_flat_map(|kind| prop::sample::select(attempt_plan(kind)))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_hls_output_contract(
            attempt in kind_strategy(),
            segment in 1u32..12,
            scale in proptest::bool::ANY,
            audio in proptest::option::of(64u32..320),
        ) {
            let out_dir = PathBuf::from("/work/renditions/480p");
            let scale_to = scale.then(|| Resolution::new(854, 480));
            let args = build_encode_args(
                Path::new("/work/source.mp4"),
                &out_dir,
                &target(scale_to, audio),
                segment,
                &attempt,
            );

            prop_assert!(has_flag_with_value(&args, "-i", "/work/source.mp4"));
            prop_assert!(has_flag_with_value(&args, "-c:v", attempt.kind.ffmpeg_name()));
            prop_assert!(has_flag_with_value(&args, "-f", "hls"));
            prop_assert!(has_flag_with_value(&args, "-hls_time", &segment.to_string()));
            prop_assert!(has_flag_with_value(&args, "-hls_list_size", "0"));
            prop_assert!(has_flag_with_value(&args, "-hls_playlist_type", "vod"));
            prop_assert!(has_flag_with_value(&args, "-start_number", "0"));
            prop_assert!(has_flag_with_value(
                &args,
                "-hls_segment_filename",
                "/work/renditions/480p/segment_%03d.ts"
            ));
            let forced = format!("expr:gte(t,n_forced*{})", segment);
            prop_assert!(has_flag_with_value(&args, "-force_key_frames", &forced));
            prop_assert_eq!(args.last().map(String::as_str), Some("/work/renditions/480p/playlist.m3u8"));

            match audio {
                Some(kbps) => {
                    let audio_bitrate = format!("{}k", kbps);
                    prop_assert!(has_flag_with_value(&args, "-b:a", &audio_bitrate));
                    prop_assert!(!has_flag(&args, "-an"));
                }
                None => {
                    prop_assert!(has_flag(&args, "-an"));
                    prop_assert!(!has_flag(&args, "-c:a"));
                }
            }

            prop_assert_eq!(has_flag(&args, "-vf"), scale);
            // a GOP never spans more than one segment
            let gop: u32 = value_of(&args, "-g").unwrap().parse().unwrap();
            prop_assert!(gop <= 25 * segment);
        }
    }

    #[test]
    fn test_software_optimal_args() {
        let attempt = attempt_plan(EncoderKind::Libx264).remove(0);
        let args = build_encode_args(
            Path::new("in.mkv"),
            Path::new("out"),
            &target(Some(Resolution::new(854, 480)), Some(128)),
            6,
            &attempt,
        );

        assert!(has_flag_with_value(&args, "-preset", "medium"));
        assert!(has_flag_with_value(&args, "-profile:v", "high"));
        assert!(!has_flag(&args, "-level:v"));
        assert!(has_flag_with_value(&args, "-vf", "scale=854:480"));
        assert!(has_flag_with_value(&args, "-pix_fmt", "yuv420p"));
        assert!(has_flag_with_value(&args, "-b:v", "1400k"));
        assert!(has_flag_with_value(&args, "-maxrate", "2100k"));
        assert!(has_flag_with_value(&args, "-bufsize", "2800k"));
        assert!(has_flag_with_value(&args, "-g", "150"));
        assert!(has_flag_with_value(&args, "-sc_threshold", "0"));
        assert!(!has_flag(&args, "-hwaccel"));
    }

    #[test]
    fn test_fallback_lowers_bitrate_and_profile() {
        let attempt = attempt_plan(EncoderKind::Libx264).remove(2);
        let args = build_encode_args(
            Path::new("in.mkv"),
            Path::new("out"),
            &target(Some(Resolution::new(854, 480)), None),
            6,
            &attempt,
        );

        assert!(has_flag_with_value(&args, "-preset", "ultrafast"));
        assert!(has_flag_with_value(&args, "-profile:v", "baseline"));
        assert!(has_flag_with_value(&args, "-level:v", "3.1"));
        assert!(has_flag_with_value(&args, "-b:v", "1120k"));
        assert!(has_flag_with_value(&args, "-g", "50"));
    }

    #[test]
    fn test_hardware_substitutions() {
        let scaled = target(Some(Resolution::new(854, 480)), Some(128));

        let nvenc = build_encode_args(
            Path::new("in"),
            Path::new("out"),
            &scaled,
            6,
            &attempt_plan(EncoderKind::Nvenc)[0],
        );
        assert!(has_flag_with_value(&nvenc, "-hwaccel", "cuda"));
        assert!(has_flag_with_value(&nvenc, "-vf", "scale_cuda=854:480"));
        assert!(has_flag_with_value(&nvenc, "-preset", "p5"));
        assert!(!has_flag(&nvenc, "-pix_fmt"));

        let vaapi = build_encode_args(
            Path::new("in"),
            Path::new("out"),
            &scaled,
            6,
            &attempt_plan(EncoderKind::Vaapi)[2],
        );
        assert!(has_flag_with_value(&vaapi, "-vaapi_device", VAAPI_DEVICE));
        assert!(has_flag_with_value(&vaapi, "-vf", "scale_vaapi=w=854:h=480"));
        assert!(has_flag_with_value(&vaapi, "-profile:v", "constrained_baseline"));
        assert!(!has_flag(&vaapi, "-preset"));

        let qsv = build_encode_args(
            Path::new("in"),
            Path::new("out"),
            &scaled,
            6,
            &attempt_plan(EncoderKind::Qsv)[1],
        );
        assert!(has_flag_with_value(&qsv, "-vf", "vpp_qsv=w=854:h=480"));
        assert!(has_flag_with_value(&qsv, "-level:v", "3.1"));
    }

    #[test]
    fn test_level_for_height() {
        assert_eq!(level_for_height(480), "3.1");
        assert_eq!(level_for_height(720), "4.1");
        assert_eq!(level_for_height(1080), "4.1");
        assert_eq!(level_for_height(1440), "5.0");
        assert_eq!(level_for_height(2160), "5.1");
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let process = FfmpegProcess::new("/nonexistent/ffmpeg-binary", Duration::from_secs(5));
        let attempt = attempt_plan(EncoderKind::Libx264).remove(0);
        let invocation = build_invocation(
            Path::new("in"),
            Path::new("out"),
            &target(None, None),
            6,
            &attempt,
        );
        let result = process.run(&invocation).await;
        assert!(matches!(result, Err(EncodeError::Io(_))));
    }
}
