//! Encoder identities and the ordered strategies tried for each rendition.

use serde::{Deserialize, Serialize};
use std::fmt;

/// H.264 encoder implementations the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderKind {
    #[serde(rename = "libx264")]
    Libx264,
    #[serde(rename = "h264_nvenc")]
    Nvenc,
    #[serde(rename = "h264_qsv")]
    Qsv,
    #[serde(rename = "h264_amf")]
    Amf,
    #[serde(rename = "h264_vaapi")]
    Vaapi,
    #[serde(rename = "h264_videotoolbox")]
    VideoToolbox,
}

impl EncoderKind {
    /// Hardware encoders in selection priority order.
    pub const HARDWARE_PRIORITY: [EncoderKind; 5] = [
        EncoderKind::Nvenc,
        EncoderKind::Qsv,
        EncoderKind::VideoToolbox,
        EncoderKind::Amf,
        EncoderKind::Vaapi,
    ];

    /// Name passed to `-c:v`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            EncoderKind::Libx264 => "libx264",
            EncoderKind::Nvenc => "h264_nvenc",
            EncoderKind::Qsv => "h264_qsv",
            EncoderKind::Amf => "h264_amf",
            EncoderKind::Vaapi => "h264_vaapi",
            EncoderKind::VideoToolbox => "h264_videotoolbox",
        }
    }

    pub fn from_ffmpeg_name(name: &str) -> Option<Self> {
        match name {
            "libx264" => Some(EncoderKind::Libx264),
            "h264_nvenc" => Some(EncoderKind::Nvenc),
            "h264_qsv" => Some(EncoderKind::Qsv),
            "h264_amf" => Some(EncoderKind::Amf),
            "h264_vaapi" => Some(EncoderKind::Vaapi),
            "h264_videotoolbox" => Some(EncoderKind::VideoToolbox),
            _ => None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderKind::Libx264)
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// H.264 profile requested from the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum H264Profile {
    High,
    Main,
    Baseline,
}

impl H264Profile {
    /// Profile spelling accepted by `-profile:v` for `kind`.
    pub fn as_arg(&self, kind: EncoderKind) -> &'static str {
        match (self, kind) {
            (H264Profile::High, _) => "high",
            (H264Profile::Main, _) => "main",
            (H264Profile::Baseline, EncoderKind::Vaapi) => "constrained_baseline",
            (H264Profile::Baseline, _) => "baseline",
        }
    }
}

/// Encoder effort; mapped to each encoder's own preset vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effort {
    Quality,
    Balanced,
    Fastest,
}

impl Effort {
    /// Preset flag and value for `kind`, if the encoder has one.
    pub fn preset_args(&self, kind: EncoderKind) -> Option<(&'static str, &'static str)> {
        match kind {
            EncoderKind::Libx264 => Some((
                "-preset",
                match self {
                    Effort::Quality => "medium",
                    Effort::Balanced => "fast",
                    Effort::Fastest => "ultrafast",
                },
            )),
            EncoderKind::Nvenc => Some((
                "-preset",
                match self {
                    Effort::Quality => "p5",
                    Effort::Balanced => "p3",
                    Effort::Fastest => "p1",
                },
            )),
            EncoderKind::Qsv => Some((
                "-preset",
                match self {
                    Effort::Quality => "medium",
                    Effort::Balanced => "faster",
                    Effort::Fastest => "veryfast",
                },
            )),
            EncoderKind::Amf => Some((
                "-quality",
                match self {
                    Effort::Quality => "quality",
                    Effort::Balanced => "balanced",
                    Effort::Fastest => "speed",
                },
            )),
            EncoderKind::Vaapi | EncoderKind::VideoToolbox => None,
        }
    }
}

/// Full-quality settings: high profile, keyframes only at segment boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalArgs {
    pub effort: Effort,
    pub profile: H264Profile,
    pub b_frames: u32,
}

/// Safer settings: main profile with an explicit level and a short GOP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibleArgs {
    pub effort: Effort,
    pub profile: H264Profile,
    pub keyframe_interval_secs: u32,
    pub b_frames: u32,
}

/// Last resort: fastest preset, baseline profile, reduced bitrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackArgs {
    pub effort: Effort,
    pub profile: H264Profile,
    pub keyframe_interval_secs: u32,
    /// Percentage of the planned bitrates actually requested
    pub bitrate_percent: u32,
}

/// One complete, independent set of encoder options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncodeStrategy {
    Optimal(OptimalArgs),
    Compatible(CompatibleArgs),
    Fallback(FallbackArgs),
}

impl EncodeStrategy {
    pub fn optimal() -> Self {
        EncodeStrategy::Optimal(OptimalArgs {
            effort: Effort::Quality,
            profile: H264Profile::High,
            b_frames: 3,
        })
    }

    pub fn compatible() -> Self {
        EncodeStrategy::Compatible(CompatibleArgs {
            effort: Effort::Balanced,
            profile: H264Profile::Main,
            keyframe_interval_secs: 2,
            b_frames: 0,
        })
    }

    pub fn fallback() -> Self {
        EncodeStrategy::Fallback(FallbackArgs {
            effort: Effort::Fastest,
            profile: H264Profile::Baseline,
            keyframe_interval_secs: 2,
            bitrate_percent: 80,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncodeStrategy::Optimal(_) => "optimal",
            EncodeStrategy::Compatible(_) => "compatible",
            EncodeStrategy::Fallback(_) => "fallback",
        }
    }
}

impl fmt::Display for EncodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A strategy bound to the encoder that runs it
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeAttempt {
    pub kind: EncoderKind,
    pub strategy: EncodeStrategy,
}

/// Ordered attempts for `kind`.
///
/// Hardware encoders get a final software fallback so a broken driver never
/// leaves a rendition unencoded.
pub fn attempt_plan(kind: EncoderKind) -> Vec<EncodeAttempt> {
    let mut attempts: Vec<EncodeAttempt> = [
        EncodeStrategy::optimal(),
        EncodeStrategy::compatible(),
        EncodeStrategy::fallback(),
    ]
    .into_iter()
    .map(|strategy| EncodeAttempt { kind, strategy })
    .collect();

    if kind.is_hardware() {
        attempts.push(EncodeAttempt {
            kind: EncoderKind::Libx264,
            strategy: EncodeStrategy::fallback(),
        });
    }
    attempts
}

/// ffmpeg stderr fragments meaning the hardware path itself is unusable.
const HARDWARE_ERROR_PATTERNS: &[&str] = &[
    "Hardware is lacking required capabilities",
    "Provided device doesn't support required NVENC features",
    "hwaccel initialisation returned error",
    "Failed setup for format cuda",
    "Failed setup for format vaapi",
    "Failed setup for format qsv",
    "Cannot open the hw device",
    "Error initializing the hwcontext",
    "No capable adapters found",
    "Device creation failed",
    "No VAAPI support",
    "DRM setup failed",
    "Cannot load libcuda",
    "No NVENC capable devices found",
];

/// True when retrying the same hardware encoder with other options is pointless.
pub fn is_hardware_failure(stderr: &str) -> bool {
    HARDWARE_ERROR_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_plan_is_three_strategies() {
        let plan = attempt_plan(EncoderKind::Libx264);
        let names: Vec<_> = plan.iter().map(|a| a.strategy.name()).collect();
        assert_eq!(names, vec!["optimal", "compatible", "fallback"]);
        assert!(plan.iter().all(|a| a.kind == EncoderKind::Libx264));
    }

    #[test]
    fn test_hardware_plan_ends_in_software() {
        for kind in EncoderKind::HARDWARE_PRIORITY {
            let plan = attempt_plan(kind);
            assert_eq!(plan.len(), 4);
            assert!(plan[..3].iter().all(|a| a.kind == kind));
            assert_eq!(plan[3].kind, EncoderKind::Libx264);
            assert_eq!(plan[3].strategy.name(), "fallback");
        }
    }

    #[test]
    fn test_ffmpeg_names_round_trip() {
        for kind in EncoderKind::HARDWARE_PRIORITY
            .into_iter()
            .chain([EncoderKind::Libx264])
        {
            assert_eq!(EncoderKind::from_ffmpeg_name(kind.ffmpeg_name()), Some(kind));
        }
        assert_eq!(EncoderKind::from_ffmpeg_name("libx265"), None);
    }

    #[test]
    fn test_serializes_as_ffmpeg_name() {
        let json = serde_json::to_string(&EncoderKind::Nvenc).unwrap();
        assert_eq!(json, "\"h264_nvenc\"");
    }

    #[test]
    fn test_hardware_failure_detection() {
        assert!(is_hardware_failure(
            "[h264_nvenc @ 0x55] Cannot load libcuda.so.1\nError while opening encoder"
        ));
        assert!(!is_hardware_failure("Invalid data found when processing input"));
    }

    #[test]
    fn test_profile_spelling() {
        assert_eq!(H264Profile::Baseline.as_arg(EncoderKind::Vaapi), "constrained_baseline");
        assert_eq!(H264Profile::Baseline.as_arg(EncoderKind::Libx264), "baseline");
        assert_eq!(Effort::Fastest.preset_args(EncoderKind::Nvenc), Some(("-preset", "p1")));
        assert_eq!(Effort::Quality.preset_args(EncoderKind::Vaapi), None);
    }
}
