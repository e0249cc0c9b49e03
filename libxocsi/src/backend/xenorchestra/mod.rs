//! Xen Orchestra block-volume backend.
//!
//! [`XoCsiDriver`] implements [`CsiIdentity`], [`CsiController`] and
//! [`CsiNode`] by delegating to three parts:
//!
//! * [`XoIdentity`] — plugin name, version and capabilities
//! * [`ClusterController`] — attaches VDIs to VMs through Xen Orchestra
//! * [`NodeController`] — stages and bind-mounts the attached device
//!
//! Volumes are pre-existing VDIs; nothing is provisioned or deleted here.

pub mod cluster;
pub mod identity;
pub mod node;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::DriverConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mount::SafeMounter;
use crate::node::CsiNode;
use crate::node_metadata::HypervisorNodeMetadata;
use crate::types::*;
use crate::version;
use crate::xo::{XoApi, XoClient};

pub use cluster::ClusterController;
pub use identity::XoIdentity;
pub use node::NodeController;

/// The full plugin: identity, controller and node services in one value.
pub struct XoCsiDriver {
    identity: XoIdentity,
    cluster: ClusterController,
    node: NodeController,
}

impl XoCsiDriver {
    pub fn new(identity: XoIdentity, cluster: ClusterController, node: NodeController) -> Self {
        Self {
            identity,
            cluster,
            node,
        }
    }

    /// Wire the production hypervisor client, mounter and node metadata
    /// source from `cfg`.
    pub fn from_config(cfg: &DriverConfig) -> Result<Self, CsiError> {
        cfg.validate()
            .map_err(|e| CsiError::InvalidArgument(e.to_string()))?;
        let xo: Arc<dyn XoApi> = Arc::new(XoClient::new(&cfg.xo)?);
        let metadata = HypervisorNodeMetadata::new(
            Arc::clone(&xo),
            cfg.node_id.clone(),
            &cfg.dmi_product_uuid_path,
        );

        info!(
            driver = %cfg.driver_name,
            xo = %cfg.xo.url,
            "xen orchestra backend configured"
        );
        Ok(Self::new(
            XoIdentity::new(&cfg.driver_name, version::version()),
            ClusterController::new(xo, cfg.attach_poll),
            NodeController::new(
                Arc::new(SafeMounter::new()),
                Arc::new(metadata),
                cfg.max_volumes_per_node,
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for XoCsiDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        self.identity.get_plugin_info().await
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        self.identity.probe().await
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        self.identity.get_plugin_capabilities().await
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for XoCsiDriver {
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        self.cluster.controller_publish_volume(req).await
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.cluster.controller_unpublish_volume(req).await
    }

    async fn get_volume(&self, volume_id: &VolumeId) -> Result<VolumeStatus, CsiError> {
        self.cluster.get_volume(volume_id).await
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        self.cluster.controller_get_capabilities().await
    }

    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.cluster.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.cluster.delete_volume(volume_id).await
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        self.cluster
            .validate_volume_capabilities(volume_id, capabilities)
            .await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        self.cluster.list_volumes().await
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        self.cluster.get_capacity().await
    }

    async fn create_snapshot(
        &self,
        source_volume_id: &VolumeId,
        name: &str,
    ) -> Result<Snapshot, CsiError> {
        self.cluster.create_snapshot(source_volume_id, name).await
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError> {
        self.cluster.delete_snapshot(snapshot_id).await
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, CsiError> {
        self.cluster.list_snapshots().await
    }

    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        self.cluster.expand_volume(volume_id, capacity_bytes).await
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for XoCsiDriver {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node.stage_volume(req).await
    }

    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        self.node.unstage_volume(req).await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node.publish_volume(req).await
    }

    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
        self.node.unpublish_volume(req).await
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        self.node.get_info().await
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        self.node.node_get_capabilities().await
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        self.node.get_volume_stats(volume_id, volume_path).await
    }

    async fn node_expand_volume(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        self.node
            .node_expand_volume(volume_id, volume_path, capacity_bytes)
            .await
    }
}
