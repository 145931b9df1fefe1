//! Encoder capability probing
//!
//! Detects accelerator vendors and the hardware encoders compiled into the
//! local ffmpeg, then validates each candidate with a short synthetic encode.
//! Every probe failure counts as "not available"; detection never fails.

use crate::encode::EncoderKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Accelerator vendors the prober knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Intel,
    Amd,
    Apple,
}

impl Vendor {
    /// Hardware encoders this vendor's devices can drive
    pub fn encoders(&self) -> &'static [EncoderKind] {
        match self {
            Vendor::Nvidia => &[EncoderKind::Nvenc],
            Vendor::Intel => &[EncoderKind::Qsv, EncoderKind::Vaapi],
            Vendor::Amd => &[EncoderKind::Amf, EncoderKind::Vaapi],
            Vendor::Apple => &[EncoderKind::VideoToolbox],
        }
    }
}

/// Immutable result of one detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub vendors: Vec<Vendor>,
    /// Hardware encoders compiled into ffmpeg
    pub compiled: Vec<EncoderKind>,
    /// Hardware encoders that passed a smoke-test encode
    pub validated: Vec<EncoderKind>,
    pub selected: EncoderKind,
}

impl CapabilityReport {
    pub fn software_only() -> Self {
        Self {
            vendors: Vec::new(),
            compiled: Vec::new(),
            validated: Vec::new(),
            selected: EncoderKind::Libx264,
        }
    }
}

/// Host queries the prober depends on. Each returns `None` when the tool is
/// missing or fails.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Output of `nvidia-smi -L`
    async fn nvidia_smi(&self) -> Option<String>;
    /// Output of `lspci`
    async fn lspci(&self) -> Option<String>;
    /// Output of `ffmpeg -hide_banner -encoders`
    async fn ffmpeg_encoders(&self) -> Option<String>;
    fn is_macos(&self) -> bool;
    /// Run a short synthetic encode through `kind`
    async fn test_encoder(&self, kind: EncoderKind) -> bool;
}

/// Probes the real host by spawning short-lived subprocesses.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    pub ffmpeg_path: PathBuf,
    pub timeout: Duration,
}

impl SystemProbe {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }

    async fn capture(&self, program: &std::path::Path, args: &[&str]) -> Option<String> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(program = %program.display(), error = %e, "Probe command unavailable");
                return None;
            }
            Err(_) => {
                debug!(program = %program.display(), "Probe command timed out");
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn nvidia_smi(&self) -> Option<String> {
        self.capture(std::path::Path::new("nvidia-smi"), &["-L"]).await
    }

    async fn lspci(&self) -> Option<String> {
        self.capture(std::path::Path::new("lspci"), &[]).await
    }

    async fn ffmpeg_encoders(&self) -> Option<String> {
        self.capture(&self.ffmpeg_path, &["-hide_banner", "-encoders"]).await
    }

    fn is_macos(&self) -> bool {
        cfg!(target_os = "macos")
    }

    async fn test_encoder(&self, kind: EncoderKind) -> bool {
        let args = smoke_test_args(kind);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

/// Arguments for a one-second `testsrc` encode to the null muxer
pub fn smoke_test_args(kind: EncoderKind) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if kind == EncoderKind::Vaapi {
        args.extend(["-vaapi_device".into(), crate::encode::ffmpeg::VAAPI_DEVICE.into()]);
    }
    args.extend(
        [
            "-f",
            "lavfi",
            "-i",
            "testsrc=duration=1:size=320x240:rate=30",
            "-c:v",
            kind.ffmpeg_name(),
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    if kind == EncoderKind::Vaapi {
        args.extend(["-vf".into(), "format=nv12,hwupload".into()]);
    } else {
        args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    }
    args.extend(["-f".into(), "null".into(), "-".into()]);
    args
}

/// Whether `nvidia-smi -L` listed at least one GPU
pub fn parse_nvidia_smi(output: &str) -> bool {
    output.lines().any(|l| l.trim_start().starts_with("GPU "))
}

/// Vendors of display controllers listed by `lspci`
pub fn parse_lspci(output: &str) -> BTreeSet<Vendor> {
    output
        .lines()
        .filter(|l| {
            l.contains("VGA compatible controller")
                || l.contains("3D controller")
                || l.contains("Display controller")
        })
        .filter_map(|l| {
            let lower = l.to_lowercase();
            if lower.contains("nvidia") {
                Some(Vendor::Nvidia)
            } else if lower.contains("intel") {
                Some(Vendor::Intel)
            } else if lower.contains("advanced micro devices")
                || lower.contains("amd")
                || lower.contains("ati ")
            {
                Some(Vendor::Amd)
            } else {
                None
            }
        })
        .collect()
}

/// Known video encoders listed by `ffmpeg -encoders`
pub fn parse_encoder_list(output: &str) -> BTreeSet<&'static str> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            if flags.len() == 6 && flags.starts_with('V') {
                EncoderKind::from_ffmpeg_name(name).map(|k| k.ffmpeg_name())
            } else {
                None
            }
        })
        .collect()
}

/// Run detection against `probe`.
///
/// With `gpu_enabled == false` nothing is spawned and the report is software-only.
pub async fn detect_with(probe: &dyn HostProbe, gpu_enabled: bool) -> CapabilityReport {
    if !gpu_enabled {
        info!("GPU encoding disabled, using software encoder");
        return CapabilityReport::software_only();
    }

    let mut vendors = BTreeSet::new();
    if probe.nvidia_smi().await.as_deref().is_some_and(parse_nvidia_smi) {
        vendors.insert(Vendor::Nvidia);
    }
    if let Some(out) = probe.lspci().await {
        vendors.extend(parse_lspci(&out));
    }
    if probe.is_macos() {
        vendors.insert(Vendor::Apple);
    }

    let compiled_names = probe
        .ffmpeg_encoders()
        .await
        .map(|out| parse_encoder_list(&out))
        .unwrap_or_default();
    let compiled: Vec<EncoderKind> = EncoderKind::HARDWARE_PRIORITY
        .into_iter()
        .filter(|k| compiled_names.contains(k.ffmpeg_name()))
        .collect();

    let mut validated = Vec::new();
    for kind in &compiled {
        let vendor_present = vendors.iter().any(|v| v.encoders().contains(kind));
        if !vendor_present {
            continue;
        }
        if probe.test_encoder(*kind).await {
            validated.push(*kind);
        } else {
            warn!(encoder = %kind, "Hardware encoder present but failed smoke test");
        }
    }

    let selected = validated.first().copied().unwrap_or(EncoderKind::Libx264);
    let report = CapabilityReport {
        vendors: vendors.into_iter().collect(),
        compiled,
        validated,
        selected,
    };
    info!(
        selected = %report.selected,
        vendors = ?report.vendors,
        validated = ?report.validated,
        "Encoder capabilities detected"
    );
    report
}

/// Detect capabilities of this host using `ffmpeg_path`
pub async fn detect(ffmpeg_path: impl Into<PathBuf>, gpu_enabled: bool) -> CapabilityReport {
    let probe = SystemProbe::new(ffmpeg_path, Duration::from_secs(20));
    detect_with(&probe, gpu_enabled).await
}
