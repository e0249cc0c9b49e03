//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make an attached volume available to workloads:
//!
//! 1. **Stage** — format the attached device if needed and mount it at a
//!    per-node staging path.
//! 2. **Publish** — bind-mount the staging path into the workload's target
//!    path.
//! 3. **Unpublish** — remove the bind mount.
//! 4. **Unstage** — unmount the staging path once nothing else uses it.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest,
    NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service — local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: mount the attached device at the staging path.
    ///
    /// Idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the staging path.
    ///
    /// Idempotent: calling it on an already-unstaged volume should
    /// succeed without error.
    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the workload.
    ///
    /// Idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount and remove the workload target path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// RPCs this node service supports.
    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Grow the filesystem on a node after the volume was expanded.
    async fn node_expand_volume(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;
}
