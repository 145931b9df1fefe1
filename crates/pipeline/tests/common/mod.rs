#![allow(dead_code)]

use async_trait::async_trait;
use hls_forge::encode::{EncodeAttempt, EncodeInvocation, ProcessExit};
use hls_forge::{EncodeError, EncoderProcess, ProbeError, SourceAnalyzer, SourceInfo};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

/// Write an HLS rendition directory with `count` six-second segments.
pub fn write_rendition(dir: &Path, count: usize) {
    std::fs::create_dir_all(dir).unwrap();
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for i in 0..count {
        let name = format!("segment_{:03}.ts", i);
        writeln!(text, "#EXTINF:6.000000,\n{}", name).unwrap();
        std::fs::write(dir.join(&name), format!("ts-{}", i)).unwrap();
    }
    text.push_str("#EXT-X-ENDLIST\n");
    std::fs::write(dir.join("playlist.m3u8"), text).unwrap();
}

/// Encoder stand-in: the first `failures` calls exit 1 without output, later
/// calls write `segments` segments and exit 0.
pub struct StubEncoder {
    failures: usize,
    segments: usize,
    calls: Mutex<Vec<EncodeAttempt>>,
}

impl StubEncoder {
    pub fn new(failures: usize, segments: usize) -> Self {
        Self {
            failures,
            segments,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<EncodeAttempt> {
        self.calls.lock().unwrap().clone()
    }

    pub fn strategies(&self) -> Vec<&'static str> {
        self.calls().iter().map(|a| a.strategy.name()).collect()
    }
}

#[async_trait]
impl EncoderProcess for StubEncoder {
    async fn run(&self, invocation: &EncodeInvocation) -> Result<ProcessExit, EncodeError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(invocation.attempt.clone());
            calls.len()
        };
        if n <= self.failures {
            return Ok(ProcessExit {
                code: Some(1),
                stderr_tail: "Error while opening encoder".into(),
            });
        }
        write_rendition(&invocation.output_dir, self.segments);
        Ok(ProcessExit {
            code: Some(0),
            stderr_tail: String::new(),
        })
    }
}

/// Analyzer returning a fixed description for any file.
pub struct StubAnalyzer(pub SourceInfo);

impl StubAnalyzer {
    pub fn hd(duration_secs: f64) -> Self {
        Self(SourceInfo {
            width: 1920,
            height: 1080,
            bitrate_kbps: 5000,
            duration_secs,
            video_codec: "h264".into(),
            frame_rate: Some(25.0),
            has_audio: true,
        })
    }
}

#[async_trait]
impl SourceAnalyzer for StubAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<SourceInfo, ProbeError> {
        if !path.exists() {
            return Err(ProbeError::FfprobeFailed(format!("{} missing", path.display())));
        }
        Ok(self.0.clone())
    }
}
