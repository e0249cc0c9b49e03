//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the envelope for every request and response exchanged
//! between the orchestrator-side client and the plugin server. Requests for
//! RPCs this plugin does not support still have a variant so that the server
//! can answer them with [`CsiError::Unimplemented`] instead of a decode
//! failure.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests ------------------------------------------------
    GetPluginInfo,
    GetPluginCapabilities,
    Probe,

    // ----- Controller requests ----------------------------------------------
    /// Attach a volume to a node.
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    /// Detach a volume from a node.
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ControllerGetVolume(VolumeId),
    ControllerGetCapabilities,
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    ListVolumes,
    GetCapacity,
    CreateSnapshot {
        source_volume_id: VolumeId,
        name: String,
    },
    DeleteSnapshot(String),
    ListSnapshots,
    ControllerExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },

    // ----- Node requests ----------------------------------------------------
    /// Format and mount the attached device at the staging path.
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    /// Bind-mount the staging path into a workload.
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    NodeGetInfo,
    NodeGetCapabilities,
    NodeGetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
        capacity_bytes: u64,
    },

    // ----- Responses --------------------------------------------------------
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    ProbeResult(bool),
    /// Context to forward to `NodeStageVolume`.
    Published(PublishContext),
    VolumeStatusResponse(VolumeStatus),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    VolumeCreated(Volume),
    VolumeList(Vec<Volume>),
    Capacity(u64),
    CapabilitiesValid(bool),
    SnapshotCreated(Snapshot),
    SnapshotList(Vec<Snapshot>),
    /// New capacity in bytes after an expansion.
    Expanded(u64),
    NodeInfoResponse(NodeInfo),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    VolumeStatsResponse(VolumeStats),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// `true` for variants a client may send.
    pub fn is_request(&self) -> bool {
        !matches!(
            self,
            Self::PluginInfoResponse(_)
                | Self::PluginCapabilitiesResponse(_)
                | Self::ProbeResult(_)
                | Self::Published(_)
                | Self::VolumeStatusResponse(_)
                | Self::ControllerCapabilitiesResponse(_)
                | Self::VolumeCreated(_)
                | Self::VolumeList(_)
                | Self::Capacity(_)
                | Self::CapabilitiesValid(_)
                | Self::SnapshotCreated(_)
                | Self::SnapshotList(_)
                | Self::Expanded(_)
                | Self::NodeInfoResponse(_)
                | Self::NodeCapabilitiesResponse(_)
                | Self::VolumeStatsResponse(_)
                | Self::Ok
                | Self::Error(_)
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => write!(
                f,
                "ControllerUnpublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerGetVolume(id) => write!(f, "ControllerGetVolume({id})"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::CreateSnapshot {
                source_volume_id, ..
            } => write!(f, "CreateSnapshot({source_volume_id})"),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots => f.write_str("ListSnapshots"),
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({volume_id})")
            }
            Self::NodeStageVolume(req) => write!(f, "NodeStageVolume({})", req.volume_id),
            Self::NodeUnstageVolume(req) => write!(f, "NodeUnstageVolume({})", req.volume_id),
            Self::NodePublishVolume(req) => write!(f, "NodePublishVolume({})", req.volume_id),
            Self::NodeUnpublishVolume(req) => {
                write!(f, "NodeUnpublishVolume({})", req.volume_id)
            }
            Self::NodeGetInfo => f.write_str("NodeGetInfo"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::NodeGetVolumeStats { volume_id, .. } => {
                write!(f, "NodeGetVolumeStats({volume_id})")
            }
            Self::NodeExpandVolume { volume_id, .. } => write!(f, "NodeExpandVolume({volume_id})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Published(ctx) => match ctx.get(PUBLISH_CONTEXT_DEVICE) {
                Some(device) => write!(f, "Published(device={device})"),
                None => f.write_str("Published"),
            },
            Self::VolumeStatusResponse(s) => write!(
                f,
                "VolumeStatus({}, nodes={})",
                s.volume.volume_id,
                s.published_node_ids.len()
            ),
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({v})"),
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::SnapshotList(ss) => write!(f, "SnapshotList(count={})", ss.len()),
            Self::Expanded(c) => write!(f, "Expanded({c})"),
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::VolumeStatsResponse(s) => write!(f, "VolumeStats(used={})", s.used_bytes),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({}: {e})", e.code()),
        }
    }
}
