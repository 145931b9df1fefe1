//! HLS playlist composition and parsing
//!
//! The master playlist is computed from the ladder alone. Rendition playlists
//! are written by ffmpeg and only parsed here, for output verification and
//! publish bookkeeping.

use crate::ladder::Ladder;
use crate::paths::{MASTER_PLAYLIST, RENDITION_PLAYLIST};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("Playlist does not start with #EXTM3U")]
    MissingHeader,

    #[error("Malformed tag on line {line}: {text}")]
    MalformedTag { line: usize, text: String },

    #[error("Segment URI on line {line} has no preceding #EXTINF")]
    UriWithoutInf { line: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render the master playlist for `ladder`.
///
/// One `EXT-X-STREAM-INF` per level with `BANDWIDTH` = video + audio bitrate
/// in bits per second, pointing at `<name>/playlist.m3u8`.
pub fn compose_master(ladder: &Ladder) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for level in ladder.levels() {
        let resolution = ladder.output_resolution(level);
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},NAME=\"{}\"\n",
            level.bandwidth_bps(),
            resolution,
            level.name
        ));
        out.push_str(&format!("{}/{}\n", level.name, RENDITION_PLAYLIST));
    }
    out
}

/// Write the master playlist into `dir` and return its path
pub async fn write_master(ladder: &Ladder, dir: &Path) -> Result<PathBuf, PlaylistError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(MASTER_PLAYLIST);
    tokio::fs::write(&path, compose_master(ladder)).await?;
    Ok(path)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub duration_secs: f64,
    pub uri: String,
}

/// Parsed rendition (media) playlist
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaPlaylist {
    pub target_duration: Option<u32>,
    pub media_sequence: u64,
    pub segments: Vec<MediaSegment>,
    pub ended: bool,
}

impl MediaPlaylist {
    pub fn total_duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }
}

pub fn parse_media_playlist(text: &str) -> Result<MediaPlaylist, PlaylistError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

    match lines.next() {
        Some((_, first)) if first.trim_start_matches('\u{feff}').trim() == "#EXTM3U" => {}
        _ => return Err(PlaylistError::MissingHeader),
    }

    let mut playlist = MediaPlaylist::default();
    let mut pending_duration: Option<f64> = None;

    for (idx, raw) in lines {
        let line = raw.trim();
        let line_no = idx + 1;
        let malformed = || PlaylistError::MalformedTag {
            line: line_no,
            text: line.to_string(),
        };

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let value = rest.split(',').next().unwrap_or("").trim();
            pending_duration = Some(value.parse::<f64>().map_err(|_| malformed())?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            playlist.target_duration = Some(rest.trim().parse().map_err(|_| malformed())?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            playlist.media_sequence = rest.trim().parse().map_err(|_| malformed())?;
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if line.starts_with('#') {
            // other tags and comments
        } else {
            let duration_secs = pending_duration
                .take()
                .ok_or(PlaylistError::UriWithoutInf { line: line_no })?;
            playlist.segments.push(MediaSegment {
                duration_secs,
                uri: line.to_string(),
            });
        }
    }

    Ok(playlist)
}

pub async fn read_media_playlist(path: &Path) -> Result<MediaPlaylist, PlaylistError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_media_playlist(&text)
}

/// Index `n` of a `segment_NNN.<ext>` file name
pub fn segment_index(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix("segment_")?;
    let (digits, ext) = rest.split_once('.')?;
    if digits.is_empty()
        || ext.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || !ext.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::{plan, Resolution};
    use crate::probe::SourceInfo;

    fn info(width: u32, height: u32, kbps: u32) -> SourceInfo {
        SourceInfo {
            width,
            height,
            bitrate_kbps: kbps,
            duration_secs: 7200.0,
            video_codec: "h264".into(),
            frame_rate: Some(24.0),
            has_audio: true,
        }
    }

    #[test]
    fn test_master_for_1080p_with_lower() {
        let ladder = plan(&info(1920, 1080, 5000), true);
        let master = compose_master(&ladder);

        assert_eq!(
            master,
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1528000,RESOLUTION=854x480,NAME=\"480p\"\n\
             480p/playlist.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=4942000,RESOLUTION=1920x1080,NAME=\"original-1080p\"\n\
             original-1080p/playlist.m3u8\n"
        );
        assert_eq!(master.matches("#EXT-X-STREAM-INF").count(), 2);
    }

    #[test]
    fn test_master_single_level_uses_source_resolution() {
        let ladder = plan(&info(640, 360, 1000), true);
        let master = compose_master(&ladder);
        assert!(master.contains("RESOLUTION=640x360"));
        assert_eq!(master.matches("#EXT-X-STREAM-INF").count(), 1);
        assert_eq!(ladder.source(), Resolution::new(640, 360));
    }

    #[tokio::test]
    async fn test_write_master_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let ladder = plan(&info(1280, 720, 3000), false);
        let path = write_master(&ladder, dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("master.m3u8"));
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("original-720p/playlist.m3u8"));
    }

    #[test]
    fn test_parse_media_playlist() {
        let text = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n\
                    #EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:6.000000,\nsegment_000.ts\n\
                    #EXTINF:6.000000,\nsegment_001.ts\n#EXTINF:2.5,\nsegment_002.ts\n#EXT-X-ENDLIST\n";
        let playlist = parse_media_playlist(text).unwrap();
        assert_eq!(playlist.target_duration, Some(6));
        assert_eq!(playlist.segments.len(), 3);
        assert_eq!(playlist.segments[2].uri, "segment_002.ts");
        assert!(playlist.ended);
        assert!((playlist.total_duration_secs() - 14.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_media_playlist("segment_000.ts\n"),
            Err(PlaylistError::MissingHeader)
        ));
        assert!(matches!(
            parse_media_playlist("#EXTM3U\nsegment_000.ts\n"),
            Err(PlaylistError::UriWithoutInf { line: 2 })
        ));
        assert!(matches!(
            parse_media_playlist("#EXTM3U\n#EXTINF:abc,\nsegment_000.ts\n"),
            Err(PlaylistError::MalformedTag { .. })
        ));
    }

    #[test]
    fn test_unterminated_playlist() {
        let playlist = parse_media_playlist("#EXTM3U\n#EXTINF:6,\nsegment_000.ts\n").unwrap();
        assert!(!playlist.ended);
    }

    #[test]
    fn test_segment_index() {
        assert_eq!(segment_index("segment_000.ts"), Some(0));
        assert_eq!(segment_index("segment_1234.ts"), Some(1234));
        assert_eq!(segment_index("segment_.ts"), None);
        assert_eq!(segment_index("segment_01a.ts"), None);
        assert_eq!(segment_index("playlist.m3u8"), None);
        assert_eq!(segment_index("segment_000.ts/../../master.m3u8"), None);
        assert_eq!(segment_index("segment_001.ts/x"), None);
        assert_eq!(segment_index("segment_002.t s"), None);
        assert_eq!(segment_index("segment_003.m4s"), Some(3));
    }
}
