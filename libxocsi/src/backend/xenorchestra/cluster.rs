//! Cluster-side volume lifecycle: attach a VDI to a VM and detach it again.
//!
//! Every call re-reads VDI, VM and VBD state from Xen Orchestra and takes the
//! smallest action that reaches the requested state. At most one VBD of a
//! VDI may be plugged at a time across the pool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::capability::is_valid_capability;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::lock::KeyedLocks;
use crate::types::*;
use crate::xo::{AttachPoll, Vbd, XoApi, XoError, wait_for_attachment};

/// Controller RPCs backed by Xen Orchestra.
pub struct ClusterController {
    xo: Arc<dyn XoApi>,
    poll: AttachPoll,
    /// Keyed by volume id.
    locks: KeyedLocks,
}

impl ClusterController {
    pub fn new(xo: Arc<dyn XoApi>, poll: AttachPoll) -> Self {
        Self {
            xo,
            poll,
            locks: KeyedLocks::new(),
        }
    }

    /// Bring the VBD of `vdi_id` on `vm_id` to the plugged state.
    async fn ensure_attached(
        &self,
        vdi_id: &str,
        vm_id: &str,
        existing: Option<Vbd>,
    ) -> Result<Vbd, CsiError> {
        match existing {
            Some(vbd) if vbd.is_ready() => {
                debug!(vbd = %vbd.id, device = vbd.device_name(), "volume already attached");
                Ok(vbd)
            }
            Some(vbd) => {
                if !vbd.attached {
                    info!(vbd = %vbd.id, "connecting existing VBD");
                    self.xo.connect_vbd(&vbd).await.map_err(|e| {
                        CsiError::Internal(format!("connect VBD {}: {e}", vbd.id))
                    })?;
                }
                Ok(wait_for_attachment(self.xo.as_ref(), vdi_id, vm_id, self.poll).await?)
            }
            None => {
                info!("attaching volume");
                self.xo
                    .attach_and_wait(vdi_id, vm_id, self.poll)
                    .await
                    .map_err(|e| match e {
                        XoError::Timeout { .. } => e.into(),
                        other => CsiError::Internal(format!(
                            "attach VDI {vdi_id} to VM {vm_id}: {other}"
                        )),
                    })
            }
        }
    }
}

fn publish_context(vbd: &Vbd) -> PublishContext {
    HashMap::from([
        (PUBLISH_CONTEXT_DEVICE.to_owned(), vbd.device_name().to_owned()),
        (PUBLISH_CONTEXT_VBD.to_owned(), vbd.id.clone()),
    ])
}

#[async_trait]
impl CsiController for ClusterController {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if req.volume_capability.is_none() {
            return Err(CsiError::InvalidArgument("volume capability is required".into()));
        }
        if !is_valid_capability(req.volume_capability.as_ref()) {
            return Err(CsiError::InvalidArgument("unsupported volume capability".into()));
        }

        let _guard = self.locks.lock(req.volume_id.as_str()).await;

        let vdi = self
            .xo
            .get_vdi(req.volume_id.as_str())
            .await
            .map_err(|e| CsiError::Internal(format!("find volume {}: {e}", req.volume_id)))?;
        let vm = self
            .xo
            .get_vm(&req.node_id)
            .await
            .map_err(|e| CsiError::Internal(format!("find node {}: {e}", req.node_id)))?;

        if vdi.pool_id != vm.pool_id {
            return Err(CsiError::FailedPrecondition(format!(
                "cannot attach a volume from pool {} to a node in pool {}",
                vdi.pool_id, vm.pool_id
            )));
        }

        let vbds = self
            .xo
            .list_vbds_for_vdi(&vdi.id)
            .await
            .map_err(|e| CsiError::Internal(format!("list VBDs of {}: {e}", vdi.id)))?;
        if let Some(other) = vbds.iter().find(|v| v.attached && v.vm_id != vm.id) {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is already attached to node {}",
                vdi.id, other.vm_id
            )));
        }

        let existing = vbds.into_iter().find(|v| v.vm_id == vm.id);
        let vbd = self.ensure_attached(&vdi.id, &vm.id, existing).await?;

        info!(vbd = %vbd.id, device = vbd.device_name(), "volume published");
        Ok(publish_context(&vbd))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }

        let _guard = self.locks.lock(req.volume_id.as_str()).await;

        let vbds = self
            .xo
            .list_vbds_for_vdi(req.volume_id.as_str())
            .await
            .map_err(|e| CsiError::Internal(format!("list VBDs of {}: {e}", req.volume_id)))?;
        let Some(vbd) = vbds.into_iter().find(|v| v.vm_id == req.node_id) else {
            debug!("no VBD for this node, nothing to detach");
            return Ok(());
        };
        if !vbd.attached {
            debug!(vbd = %vbd.id, "VBD already disconnected");
            return Ok(());
        }

        self.xo
            .disconnect_vbd(&vbd)
            .await
            .map_err(|e| CsiError::Internal(format!("disconnect VBD {}: {e}", vbd.id)))?;
        info!(vbd = %vbd.id, "volume unpublished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<VolumeStatus, CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }

        let vdi = self
            .xo
            .get_vdi(volume_id.as_str())
            .await
            .map_err(|e| CsiError::Internal(format!("find volume {volume_id}: {e}")))?;
        let vbds = self
            .xo
            .list_vbds_for_vdi(&vdi.id)
            .await
            .map_err(|e| CsiError::Internal(format!("list VBDs of {}: {e}", vdi.id)))?;

        Ok(VolumeStatus {
            volume: Volume {
                volume_id: VolumeId(vdi.id),
                capacity_bytes: vdi.size,
                volume_context: HashMap::new(),
                accessible_topology: vec![Topology {
                    segments: HashMap::from([(TOPOLOGY_POOL_ID.to_owned(), vdi.pool_id)]),
                }],
            },
            published_node_ids: vbds
                .into_iter()
                .filter(|v| v.attached)
                .map(|v| v.vm_id)
                .collect(),
        })
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::GetVolume,
        ])
    }

    async fn create_volume(&self, _req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        Err(CsiError::unimplemented("CreateVolume"))
    }

    async fn delete_volume(&self, _volume_id: &VolumeId) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("DeleteVolume"))
    }

    async fn validate_volume_capabilities(
        &self,
        _volume_id: &VolumeId,
        _capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        Err(CsiError::unimplemented("ValidateVolumeCapabilities"))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Err(CsiError::unimplemented("ListVolumes"))
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("GetCapacity"))
    }

    async fn create_snapshot(
        &self,
        _source_volume_id: &VolumeId,
        _name: &str,
    ) -> Result<Snapshot, CsiError> {
        Err(CsiError::unimplemented("CreateSnapshot"))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("DeleteSnapshot"))
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, CsiError> {
        Err(CsiError::unimplemented("ListSnapshots"))
    }

    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("ControllerExpandVolume"))
    }
}
