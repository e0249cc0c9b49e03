//! Linux mount executor.
//!
//! Filesystems are probed with `blkid` and created with `mkfs.<fstype>`;
//! mounts and unmounts go through `nix::mount`. Mount state is read from
//! `/proc/self/mounts` on every call.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, info, instrument, warn};

use super::{MountEntry, MountRecord, Mounter, parse_mount_table, record_for};
use crate::error::CsiError;

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// `blkid` exit status when the device carries no recognizable signature.
const BLKID_NOTHING_FOUND: i32 = 2;

/// Production [`Mounter`].
#[derive(Debug, Clone)]
pub struct SafeMounter {
    mount_table: PathBuf,
}

impl Default for SafeMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeMounter {
    pub fn new() -> Self {
        Self {
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Read mount state from `path` instead of `/proc/self/mounts`.
    pub fn with_mount_table(path: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: path.into(),
        }
    }

    async fn entries(&self) -> Result<Vec<MountEntry>, CsiError> {
        let contents = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|e| {
                CsiError::Internal(format!("read {}: {e}", self.mount_table.display()))
            })?;
        Ok(parse_mount_table(&contents))
    }

    /// Existing filesystem type on `device`, `None` when unformatted.
    async fn probe_fs(&self, device: &Path) -> Result<Option<String>, CsiError> {
        let output = tokio::process::Command::new("blkid")
            .args(["-p", "-s", "TYPE", "-o", "value"])
            .arg(device)
            .output()
            .await
            .map_err(|e| mount_failed(device, format!("run blkid: {e}")))?;

        match output.status.code() {
            Some(0) => {
                let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                Ok((!fs.is_empty()).then_some(fs))
            }
            Some(BLKID_NOTHING_FOUND) => Ok(None),
            code => Err(mount_failed(
                device,
                format!(
                    "blkid exited with {code:?}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
        }
    }

    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), CsiError> {
        let mut cmd = tokio::process::Command::new(format!("mkfs.{fs_type}"));
        if fs_type.starts_with("ext") {
            cmd.args(["-F", "-m0"]);
        }
        cmd.arg(device);

        info!(device = %device.display(), fs_type, "formatting device");
        let output = cmd
            .output()
            .await
            .map_err(|e| mount_failed(device, format!("run mkfs.{fs_type}: {e}")))?;
        if !output.status.success() {
            return Err(mount_failed(
                device,
                format!(
                    "mkfs.{fs_type} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

fn mount_failed(path: &Path, reason: impl Into<String>) -> CsiError {
    CsiError::MountFailed {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn unmount_failed(path: &Path, reason: impl Into<String>) -> CsiError {
    CsiError::UnmountFailed {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Split mount options into kernel flags and filesystem data.
fn split_options(options: &[String]) -> (MsFlags, Vec<&str>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" => {}
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, data)
}

/// Canonical form of `path` when it exists, so it compares equal to the
/// kernel's view in the mount table.
async fn resolve(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl Mounter for SafeMounter {
    #[instrument(skip_all, fields(source = %source.display(), target = %target.display(), fs_type = %fs_type))]
    async fn format_and_mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| mount_failed(target, e.to_string()))?;

        match self.probe_fs(source).await? {
            None => self.format(source, fs_type).await?,
            Some(existing) if existing == fs_type => {
                debug!(fs_type, "device already formatted");
            }
            Some(existing) => {
                return Err(mount_failed(
                    source,
                    format!("requested {fs_type} but the device already contains {existing}"),
                ));
            }
        }

        self.mount(source, target, fs_type, options).await
    }

    #[instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let (flags, data) = split_options(options);
        let data = data.join(",");
        let bind = flags.contains(MsFlags::MS_BIND);

        nix::mount::mount(
            Some(source),
            target,
            (!bind && !fs_type.is_empty()).then_some(fs_type),
            flags,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(|e| mount_failed(target, e.to_string()))?;

        // The kernel ignores MS_RDONLY on the initial bind mount; a remount
        // is needed to enforce it.
        if bind && flags.contains(MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_failed(target, format!("remount read-only: {e}")))?;
        }

        info!(bind, read_only = flags.contains(MsFlags::MS_RDONLY), "mounted");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target.display()))]
    async fn cleanup_mount_point(&self, target: &Path) -> Result<(), CsiError> {
        match tokio::fs::symlink_metadata(target).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("target does not exist, nothing to clean up");
                return Ok(());
            }
            Err(e) => return Err(unmount_failed(target, format!("stat: {e}"))),
            Ok(_) => {}
        }

        if self.is_mount_point(target).await? {
            nix::mount::umount(target).map_err(|e| unmount_failed(target, e.to_string()))?;
            debug!("unmounted");
        }

        match tokio::fs::remove_dir(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(error = %e, "failed to remove mount directory");
                return Err(unmount_failed(target, format!("remove dir: {e}")));
            }
        }
        Ok(())
    }

    fn device_path(&self, device_name: &str, _vbd_id: &str) -> PathBuf {
        // The guest device name is stable for the lifetime of the VBD.
        Path::new("/dev").join(device_name)
    }

    async fn mount_record(&self, mount_path: &Path) -> Result<MountRecord, CsiError> {
        let path = resolve(mount_path).await;
        Ok(record_for(&self.entries().await?, &path))
    }

    async fn is_mount_point(&self, target: &Path) -> Result<bool, CsiError> {
        let path = resolve(target).await;
        Ok(self.entries().await?.iter().any(|e| e.mount_point == path))
    }
}
