//! CSI Controller service trait.
//!
//! The Controller service manages the cluster-level volume lifecycle. For a
//! block-volume plugin backed by a hypervisor this means attaching an
//! existing volume to a node (publish) and detaching it again (unpublish).
//! Provisioning, snapshots and resizing are part of the trait so that the
//! transport can route them, but a backend may answer them with
//! [`CsiError::Unimplemented`].

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest,
    CreateVolumeRequest, PublishContext, Snapshot, Volume, VolumeCapability, VolumeId,
    VolumeStatus,
};

/// Controller service — cluster-level volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Attach a volume to a node.
    ///
    /// The returned publish context must be forwarded to `NodeStageVolume`.
    /// Repeating the call for an already attached volume returns the same
    /// context.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError>;

    /// Detach a volume from a node. Idempotent.
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Describe a volume and the nodes it is published to.
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<VolumeStatus, CsiError>;

    /// RPCs this controller supports.
    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    /// Provision a new volume.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    async fn create_snapshot(
        &self,
        source_volume_id: &VolumeId,
        name: &str,
    ) -> Result<Snapshot, CsiError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError>;

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, CsiError>;

    /// Grow a volume; returns the new capacity.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;
}
