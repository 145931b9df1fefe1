//! Per-job local workspace and asset lease.
//!
//! A workspace is `<root>/<asset>_<unix-millis>`. It survives failed runs and
//! is picked up again by the next run for the same asset, which is what makes
//! encoding and publishing resumable. Layout:
//!
//! ```text
//! <root>/<asset>_<millis>/source.<ext>
//! <root>/<asset>_<millis>/hls/master.m3u8
//! <root>/<asset>_<millis>/hls/<rendition>/playlist.m3u8
//! <root>/<asset>_<millis>/hls/<rendition>/segment_NNN.ts
//! ```

use crate::job::current_timestamp_ms;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Asset {asset_id} is already being converted by process {pid}")]
    Locked { asset_id: String, pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Local working directory owned by one job.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
    reused: bool,
}

impl Workspace {
    /// Open the newest existing workspace for `asset_id` under `root`, or create one.
    pub async fn open(root: &Path, asset_id: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;

        if let Some(dir) = find_existing(root, asset_id).await? {
            info!(path = %dir.display(), "Resuming from existing workspace");
            return Ok(Self { dir, reused: true });
        }

        let dir = root.join(format!("{}_{}", asset_id, current_timestamp_ms()));
        tokio::fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "Created workspace");
        Ok(Self { dir, reused: false })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this workspace was left behind by an earlier run
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn source_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("source.{}", extension))
    }

    /// Directory the master playlist and rendition directories are written to
    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("hls")
    }

    pub fn rendition_dir(&self, rendition: &str) -> PathBuf {
        self.output_dir().join(rendition)
    }

    pub async fn remove(self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Newest `<asset>_<digits>` directory under `root`
async fn find_existing(root: &Path, asset_id: &str) -> io::Result<Option<PathBuf>> {
    let prefix = format!("{}_", asset_id);
    let mut newest: Option<(u128, PathBuf)> = None;

    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(stamp) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
            .and_then(|rest| rest.parse::<u128>().ok())
        else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| stamp > *best) {
            newest = Some((stamp, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Host-local exclusive claim on an asset, held for the duration of a job.
///
/// The lease file records the holder's pid. A lease whose holder is no longer
/// running is taken over.
#[derive(Debug)]
pub struct AssetLease {
    path: PathBuf,
}

impl AssetLease {
    pub async fn acquire(root: &Path, asset_id: &str) -> Result<Self, WorkspaceError> {
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(format!("{}.lock", asset_id));

        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    file.flush().await?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = tokio::fs::read_to_string(&path)
                        .await
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if holder_alive(pid) => {
                            return Err(WorkspaceError::Locked {
                                asset_id: asset_id.to_string(),
                                pid,
                            });
                        }
                        _ => {
                            warn!(lease = %path.display(), "Taking over stale lease");
                            match tokio::fs::remove_file(&path).await {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkspaceError::Locked {
            asset_id: asset_id.to_string(),
            pid: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AssetLease {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn holder_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    System::new_all().process(Pid::from_u32(pid)).is_some()
}
