//! Output verification for rendition directories.
//!
//! ffmpeg's exit code is advisory: a run can report failure after writing a
//! complete rendition. The directory contents decide.

use crate::paths::RENDITION_PLAYLIST;
use crate::playlist::{read_media_playlist, segment_index, PlaylistError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How much a rendition may deviate from a perfect encode and still be accepted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Segments the rendition may deviate from `ceil(duration / segment_duration)`
    pub segment_tolerance: u32,
    /// Require `#EXT-X-ENDLIST`
    pub require_endlist: bool,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            segment_tolerance: 1,
            require_endlist: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Playlist {0} is missing")]
    MissingPlaylist(PathBuf),

    #[error("Playlist is unreadable: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Playlist lists no segments")]
    NoSegments,

    #[error("Segment {uri} is not named segment_NNN")]
    BadSegmentName { uri: String },

    #[error("Segment numbering gap: expected {expected}, found {found}")]
    Gap { expected: u32, found: u32 },

    #[error("Segment {0} is missing")]
    MissingSegment(String),

    #[error("Segment {0} is empty")]
    EmptySegment(String),

    #[error("Playlist has no #EXT-X-ENDLIST")]
    NoEndlist,

    #[error("Only {found} segments, expected at least {required}")]
    TooFewSegments { found: usize, required: usize },

    #[error("{found} segments, expected at most {allowed}")]
    TooManySegments { found: usize, allowed: usize },

    #[error("Segments run to {found_secs:.3}s, limit is {max_secs}s")]
    SegmentTooLong { found_secs: f64, max_secs: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A verified rendition directory
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionOutput {
    pub name: String,
    pub dir: PathBuf,
    pub playlist: PathBuf,
    /// Segment file names in playlist order
    pub segments: Vec<String>,
}

impl RenditionOutput {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

/// Segments a complete encode of `duration_secs` must at least produce
pub fn required_segments(duration_secs: f64, segment_duration_secs: u32, tolerance: u32) -> usize {
    if segment_duration_secs == 0 || duration_secs <= 0.0 {
        return 1;
    }
    let expected = (duration_secs / f64::from(segment_duration_secs)).ceil() as usize;
    expected.saturating_sub(tolerance as usize).max(1)
}

/// Segments a complete encode of `duration_secs` may at most produce, `None`
/// when the duration gives no bound
pub fn max_segments(duration_secs: f64, segment_duration_secs: u32, tolerance: u32) -> Option<usize> {
    if segment_duration_secs == 0 || duration_secs <= 0.0 {
        return None;
    }
    let expected = (duration_secs / f64::from(segment_duration_secs)).ceil() as usize;
    Some(expected + tolerance as usize)
}

/// Check that `dir` holds a complete rendition named `name`.
pub async fn verify_rendition(
    name: &str,
    dir: &Path,
    duration_secs: f64,
    segment_duration_secs: u32,
    policy: &VerifyPolicy,
) -> Result<RenditionOutput, VerifyError> {
    let playlist_path = dir.join(RENDITION_PLAYLIST);
    if !tokio::fs::try_exists(&playlist_path).await? {
        return Err(VerifyError::MissingPlaylist(playlist_path));
    }

    let playlist = read_media_playlist(&playlist_path).await?;
    if playlist.segments.is_empty() {
        return Err(VerifyError::NoSegments);
    }

    let mut segments = Vec::with_capacity(playlist.segments.len());
    for (expected, segment) in playlist.segments.iter().enumerate() {
        let found = segment_index(&segment.uri).ok_or_else(|| VerifyError::BadSegmentName {
            uri: segment.uri.clone(),
        })?;
        if found as usize != expected {
            return Err(VerifyError::Gap {
                expected: expected as u32,
                found,
            });
        }

        match tokio::fs::metadata(dir.join(&segment.uri)).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Err(VerifyError::EmptySegment(segment.uri.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VerifyError::MissingSegment(segment.uri.clone()))
            }
            Err(e) => return Err(VerifyError::Io(e)),
        }
        segments.push(segment.uri.clone());
    }

    if policy.require_endlist && !playlist.ended {
        return Err(VerifyError::NoEndlist);
    }

    let required = required_segments(duration_secs, segment_duration_secs, policy.segment_tolerance);
    if segments.len() < required {
        return Err(VerifyError::TooFewSegments {
            found: segments.len(),
            required,
        });
    }
    if let Some(allowed) = max_segments(duration_secs, segment_duration_secs, policy.segment_tolerance) {
        if segments.len() > allowed {
            return Err(VerifyError::TooManySegments {
                found: segments.len(),
                allowed,
            });
        }
    }

    // output cut at another segment length is not ours to reuse
    if segment_duration_secs > 0 {
        let max_secs = segment_duration_secs + 1;
        let longest = playlist
            .segments
            .iter()
            .map(|s| s.duration_secs)
            .fold(f64::from(playlist.target_duration.unwrap_or(0)), f64::max);
        if longest > f64::from(max_secs) {
            return Err(VerifyError::SegmentTooLong {
                found_secs: longest,
                max_secs,
            });
        }
    }

    Ok(RenditionOutput {
        name: name.to_string(),
        dir: dir.to_path_buf(),
        playlist: playlist_path,
        segments,
    })
}
