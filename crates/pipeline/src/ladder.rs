//! Quality ladder planning
//!
//! Derives the set of renditions to encode from the probed source. The policy
//! preserves quality: the pass-through rendition keeps the source resolution at
//! 95% of its bitrate, and the optional lower rendition never upscales.

use crate::probe::SourceInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Pass-through target as a fraction of the source bitrate
pub const PASSTHROUGH_BITRATE_RATIO: f64 = 0.95;
/// Sources reporting less than this are treated as mis-probed and clamped up
pub const MIN_SOURCE_BITRATE_KBPS: u32 = 2000;
pub const LOWER_RENDITION_HEIGHT: u32 = 480;
pub const LOWER_RENDITION_BITRATE_KBPS: u32 = 1400;
pub const LOWER_RENDITION_NAME: &str = "480p";
pub const PASSTHROUGH_AUDIO_KBPS: u32 = 192;
pub const LOWER_AUDIO_KBPS: u32 = 128;

/// Prefix shared by every pass-through rendition name
pub const PASSTHROUGH_PREFIX: &str = "original-";

#[derive(Debug, Error, PartialEq)]
pub enum LadderError {
    #[error("Ladder has no levels")]
    Empty,

    #[error("Duplicate rendition name: {0}")]
    DuplicateName(String),

    #[error("Ladder must contain exactly one pass-through level, found {0}")]
    PassthroughCount(usize),

    #[error("Rendition {name} ({height} lines) is not below the source ({source_height} lines)")]
    NotBelowSource {
        name: String,
        height: u32,
        source_height: u32,
    },
}

/// Frame size in pixels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One output rendition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityLevel {
    pub name: String,
    /// Scaled output size; `None` for the pass-through level, which keeps the source size
    pub resolution: Option<Resolution>,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    /// `None` when the source carries no audio
    pub audio_bitrate_kbps: Option<u32>,
}

impl QualityLevel {
    pub fn is_passthrough(&self) -> bool {
        self.resolution.is_none()
    }

    /// Advertised peak bandwidth in bits per second (video + audio)
    pub fn bandwidth_bps(&self) -> u64 {
        let total_kbps =
            u64::from(self.video_bitrate_kbps) + u64::from(self.audio_bitrate_kbps.unwrap_or(0));
        total_kbps * 1000
    }
}

/// Ordered, non-empty set of renditions for one asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ladder {
    levels: Vec<QualityLevel>,
    source: Resolution,
}

impl Ladder {
    /// Build a ladder, checking its invariants
    pub fn new(levels: Vec<QualityLevel>, source: Resolution) -> Result<Self, LadderError> {
        if levels.is_empty() {
            return Err(LadderError::Empty);
        }

        let mut names = HashSet::new();
        for level in &levels {
            if !names.insert(level.name.as_str()) {
                return Err(LadderError::DuplicateName(level.name.clone()));
            }
        }

        let passthrough = levels.iter().filter(|l| l.is_passthrough()).count();
        if passthrough != 1 {
            return Err(LadderError::PassthroughCount(passthrough));
        }

        for level in &levels {
            if let Some(res) = level.resolution {
                if res.height >= source.height {
                    return Err(LadderError::NotBelowSource {
                        name: level.name.clone(),
                        height: res.height,
                        source_height: source.height,
                    });
                }
            }
        }

        Ok(Self { levels, source })
    }

    pub fn levels(&self) -> &[QualityLevel] {
        &self.levels
    }

    pub fn source(&self) -> Resolution {
        self.source
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Size a player will actually see for `level`
    pub fn output_resolution(&self, level: &QualityLevel) -> Resolution {
        level.resolution.unwrap_or(self.source)
    }

    pub fn passthrough(&self) -> Option<&QualityLevel> {
        self.levels.iter().find(|l| l.is_passthrough())
    }
}

/// Name for the pass-through rendition, by source height tier
pub fn passthrough_name(height: u32) -> String {
    let tier = match height {
        h if h >= 2160 => "4k".to_string(),
        h if h >= 1440 => "1440p".to_string(),
        h if h >= 1080 => "1080p".to_string(),
        h if h >= 720 => "720p".to_string(),
        h => format!("{}p", h),
    };
    format!("{}{}", PASSTHROUGH_PREFIX, tier)
}

/// Width for `target_height` preserving the source aspect ratio, rounded to an even number
pub fn scaled_width(source: Resolution, target_height: u32) -> u32 {
    if source.height == 0 {
        return 0;
    }
    let exact = f64::from(target_height) * f64::from(source.width) / f64::from(source.height);
    ((exact / 2.0).round() as u32) * 2
}

fn level_with_target(
    name: String,
    resolution: Option<Resolution>,
    target_kbps: u32,
    audio_bitrate_kbps: Option<u32>,
) -> QualityLevel {
    QualityLevel {
        name,
        resolution,
        video_bitrate_kbps: target_kbps,
        max_bitrate_kbps: target_kbps.saturating_mul(3) / 2,
        buffer_size_kbps: target_kbps.saturating_mul(2),
        audio_bitrate_kbps,
    }
}

/// Plan the ladder for a probed source
///
/// Returns levels in ascending bandwidth order: the lower rendition (when
/// requested and the source is taller than it) followed by the pass-through.
pub fn plan(source: &SourceInfo, include_lower_rendition: bool) -> Ladder {
    let source_res = Resolution::new(source.width, source.height);
    let source_kbps = source.bitrate_kbps.max(MIN_SOURCE_BITRATE_KBPS);
    let passthrough_kbps = (f64::from(source_kbps) * PASSTHROUGH_BITRATE_RATIO).round() as u32;

    let mut levels = Vec::with_capacity(2);

    let lower_width = scaled_width(source_res, LOWER_RENDITION_HEIGHT);
    if include_lower_rendition && source.height > LOWER_RENDITION_HEIGHT && lower_width > 0 {
        levels.push(level_with_target(
            LOWER_RENDITION_NAME.to_string(),
            Some(Resolution::new(lower_width, LOWER_RENDITION_HEIGHT)),
            LOWER_RENDITION_BITRATE_KBPS.min(passthrough_kbps),
            source.has_audio.then_some(LOWER_AUDIO_KBPS),
        ));
    }

    levels.push(level_with_target(
        passthrough_name(source.height),
        None,
        passthrough_kbps,
        source.has_audio.then_some(PASSTHROUGH_AUDIO_KBPS),
    ));

    Ladder {
        levels,
        source: source_res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn source(width: u32, height: u32, bitrate_kbps: u32, has_audio: bool) -> SourceInfo {
        SourceInfo {
            width,
            height,
            bitrate_kbps,
            duration_secs: 60.0,
            video_codec: "h264".to_string(),
            frame_rate: Some(30.0),
            has_audio,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_ladder_shape(
            width in 160u32..8000,
            height in 120u32..4400,
            bitrate in 0u32..100_000,
            include in proptest::bool::ANY,
            has_audio in proptest::bool::ANY,
        ) {
            let info = source(width, height, bitrate, has_audio);
            let ladder = plan(&info, include);

            let originals = ladder.levels().iter()
                .filter(|l| l.name.starts_with(PASSTHROUGH_PREFIX))
                .count();
            let lowers = ladder.levels().iter()
                .filter(|l| l.name == LOWER_RENDITION_NAME)
                .count();

            prop_assert_eq!(originals, 1);
            if include && height > 480 {
                prop_assert_eq!(lowers, 1);
                prop_assert_eq!(ladder.len(), 2);
            } else {
                prop_assert_eq!(lowers, 0);
                prop_assert_eq!(ladder.len(), 1);
            }

            // The invariants hold when re-checked through the validating constructor
            prop_assert!(Ladder::new(ladder.levels().to_vec(), ladder.source()).is_ok());
        }

        #[test]
        fn prop_never_upscales(
            width in 160u32..1000,
            height in 120u32..=480,
            bitrate in 0u32..50_000,
        ) {
            let ladder = plan(&source(width, height, bitrate, true), true);
            prop_assert!(ladder.levels().iter().all(|l| l.name != LOWER_RENDITION_NAME));
            for level in ladder.levels() {
                let out = ladder.output_resolution(level);
                prop_assert!(out.height <= height);
            }
        }

        #[test]
        fn prop_bitrates_are_consistent(
            height in 481u32..4400,
            bitrate in 0u32..200_000,
        ) {
            let ladder = plan(&source(height * 16 / 9, height, bitrate, true), true);
            let floor = (f64::from(MIN_SOURCE_BITRATE_KBPS) * PASSTHROUGH_BITRATE_RATIO).round() as u32;

            for level in ladder.levels() {
                prop_assert!(level.max_bitrate_kbps >= level.video_bitrate_kbps);
                prop_assert!(level.buffer_size_kbps >= level.max_bitrate_kbps);
            }
            let original = ladder.passthrough().unwrap();
            prop_assert!(original.video_bitrate_kbps >= floor);
            // ascending bandwidth
            let bw: Vec<u64> = ladder.levels().iter().map(|l| l.bandwidth_bps()).collect();
            prop_assert!(bw.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_1080p_5mbps_with_lower_rendition() {
        let ladder = plan(&source(1920, 1080, 5000, true), true);
        let levels = ladder.levels();

        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].name, "480p");
        assert_eq!(levels[0].resolution, Some(Resolution::new(854, 480)));
        assert_eq!(levels[0].video_bitrate_kbps, 1400);
        assert_eq!(levels[0].audio_bitrate_kbps, Some(128));

        assert_eq!(levels[1].name, "original-1080p");
        assert_eq!(levels[1].video_bitrate_kbps, 4750);
        assert_eq!(levels[1].max_bitrate_kbps, 7125);
        assert_eq!(levels[1].buffer_size_kbps, 9500);
        assert_eq!(levels[1].audio_bitrate_kbps, Some(192));
        assert_eq!(
            ladder.output_resolution(&levels[1]),
            Resolution::new(1920, 1080)
        );
    }

    #[test]
    fn test_low_bitrate_is_clamped_to_floor() {
        let ladder = plan(&source(1280, 720, 300, true), false);
        assert_eq!(ladder.levels()[0].video_bitrate_kbps, 1900);
    }

    #[test]
    fn test_no_audio_disables_audio() {
        let ladder = plan(&source(1920, 1080, 8000, false), true);
        assert!(ladder.levels().iter().all(|l| l.audio_bitrate_kbps.is_none()));
        assert_eq!(ladder.levels()[1].bandwidth_bps(), 7_600_000);
    }

    #[test]
    fn test_passthrough_names() {
        assert_eq!(passthrough_name(2160), "original-4k");
        assert_eq!(passthrough_name(1440), "original-1440p");
        assert_eq!(passthrough_name(1080), "original-1080p");
        assert_eq!(passthrough_name(800), "original-720p");
        assert_eq!(passthrough_name(576), "original-576p");
    }

    #[test]
    fn test_scaled_width_is_even() {
        assert_eq!(scaled_width(Resolution::new(1920, 1080), 480), 854);
        assert_eq!(scaled_width(Resolution::new(1440, 1080), 480), 640);
        assert_eq!(scaled_width(Resolution::new(1080, 1920), 480), 270);
    }

    #[test]
    fn test_ladder_new_rejects_broken_ladders() {
        let src = Resolution::new(1920, 1080);
        let original = level_with_target("original-1080p".into(), None, 4750, None);
        let lower = level_with_target(
            "480p".into(),
            Some(Resolution::new(854, 480)),
            1400,
            None,
        );

        assert_eq!(Ladder::new(vec![], src), Err(LadderError::Empty));
        assert_eq!(
            Ladder::new(vec![lower.clone()], src),
            Err(LadderError::PassthroughCount(0))
        );
        assert!(matches!(
            Ladder::new(vec![original.clone(), original.clone()], src),
            Err(LadderError::DuplicateName(_))
        ));
        let tall = level_with_target(
            "big".into(),
            Some(Resolution::new(3840, 2160)),
            9000,
            None,
        );
        assert!(matches!(
            Ladder::new(vec![tall, original.clone()], src),
            Err(LadderError::NotBelowSource { .. })
        ));
        assert!(Ladder::new(vec![lower, original], src).is_ok());
    }
}
