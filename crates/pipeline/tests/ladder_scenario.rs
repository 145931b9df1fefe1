mod common;

use common::StubAnalyzer;
use hls_forge::{compose_master, plan, Resolution};

#[test]
fn two_hour_1080p_source_with_lower_rendition() {
    let source = StubAnalyzer::hd(2.0 * 3600.0).0;
    let ladder = plan(&source, true);

    let summary: Vec<(&str, u32)> = ladder
        .levels()
        .iter()
        .map(|l| (l.name.as_str(), l.video_bitrate_kbps))
        .collect();
    assert_eq!(summary, vec![("480p", 1400), ("original-1080p", 4750)]);
    assert_eq!(ladder.levels()[0].resolution, Some(Resolution::new(854, 480)));
    assert!(ladder.levels()[1].is_passthrough());

    let master = compose_master(&ladder);
    let lines: Vec<&str> = master.lines().collect();
    assert_eq!(lines[0], "#EXTM3U");
    assert_eq!(
        lines[2],
        "#EXT-X-STREAM-INF:BANDWIDTH=1528000,RESOLUTION=854x480,NAME=\"480p\""
    );
    assert_eq!(lines[3], "480p/playlist.m3u8");
    assert_eq!(
        lines[4],
        "#EXT-X-STREAM-INF:BANDWIDTH=4942000,RESOLUTION=1920x1080,NAME=\"original-1080p\""
    );
    assert_eq!(lines[5], "original-1080p/playlist.m3u8");
}

#[test]
fn same_source_without_lower_rendition_is_passthrough_only() {
    let source = StubAnalyzer::hd(2.0 * 3600.0).0;
    let ladder = plan(&source, false);

    assert_eq!(ladder.len(), 1);
    assert_eq!(ladder.levels()[0].name, "original-1080p");
    assert_eq!(compose_master(&ladder).matches("#EXT-X-STREAM-INF").count(), 1);
}

#[test]
fn low_bitrate_probe_is_clamped_before_planning() {
    let mut source = StubAnalyzer::hd(600.0).0;
    source.bitrate_kbps = 300;
    let ladder = plan(&source, true);

    // 2000 kbps floor, 95% of it for the pass-through
    assert_eq!(ladder.passthrough().unwrap().video_bitrate_kbps, 1900);
    assert_eq!(ladder.levels()[0].video_bitrate_kbps, 1400);
}
