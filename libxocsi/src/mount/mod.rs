//! Mount executor.
//!
//! [`Mounter`] wraps the OS-level format / mount / unmount / inspection
//! operations the node controller needs. [`SafeMounter`] is the Linux
//! implementation. The mount table is re-read on every query; nothing here
//! is cached between RPCs.

pub mod linux;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::CsiError;

pub use linux::SafeMounter;

/// What is mounted at a path, as seen in the mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountRecord {
    /// Backing device name without the `/dev/` prefix, empty when the path
    /// is not a mount point.
    pub device: String,
    /// Number of mount-table entries backed by that device. A staging mount
    /// with two workload bind mounts on top has a count of 3.
    pub ref_count: usize,
}

impl MountRecord {
    pub fn is_mounted(&self) -> bool {
        self.ref_count > 0
    }
}

/// OS mount capability.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Create a filesystem of type `fs_type` on `source` if it has none, then
    /// mount it at `target` (created if missing).
    async fn format_and_mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Mount `source` at `target`. `options` may contain `bind` and `ro`.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Unmount `target` if it is a mount point, then remove the directory.
    /// A missing `target` is not an error.
    async fn cleanup_mount_point(&self, target: &Path) -> Result<(), CsiError>;

    /// Device node for a guest device name.
    fn device_path(&self, device_name: &str, vbd_id: &str) -> PathBuf;

    /// Backing device and reference count for `mount_path`.
    async fn mount_record(&self, mount_path: &Path) -> Result<MountRecord, CsiError>;

    async fn is_mount_point(&self, target: &Path) -> Result<bool, CsiError>;
}

// ---------------------------------------------------------------------------
// Mount table
// ---------------------------------------------------------------------------

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Parse the contents of `/proc/self/mounts`.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`, with
/// whitespace inside fields escaped as octal (`\040` for a space).
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = unescape(fields.next()?);
            let mount_point = PathBuf::from(unescape(fields.next()?));
            let fs_type = fields.next()?.to_owned();
            let options = fields
                .next()
                .map(|o| o.split(',').map(str::to_owned).collect())
                .unwrap_or_default();
            Some(MountEntry {
                device,
                mount_point,
                fs_type,
                options,
            })
        })
        .collect()
}

/// Resolve the [`MountRecord`] of `mount_path` from parsed entries.
///
/// The device is taken from the first entry mounted at `mount_path`; the
/// reference count is the number of entries sharing that device.
pub fn record_for(entries: &[MountEntry], mount_path: &Path) -> MountRecord {
    let Some(device) = entries
        .iter()
        .find(|e| e.mount_point == mount_path)
        .map(|e| e.device.as_str())
    else {
        return MountRecord::default();
    };

    let ref_count = entries.iter().filter(|e| e.device == device).count();
    MountRecord {
        device: device.strip_prefix("/dev/").unwrap_or(device).to_owned(),
        ref_count,
    }
}

fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_owned();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && let Some(code) = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 8).ok())
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
