//! Core CSI types: volumes, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the Xen Orchestra backend. They are all [`Serialize`]/[`Deserialize`]
//! so they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Publish-context key carrying the guest device name (e.g. `xvdb`).
pub const PUBLISH_CONTEXT_DEVICE: &str = "device";
/// Publish-context key carrying the VBD (attachment) identifier.
pub const PUBLISH_CONTEXT_VBD: &str = "vbd";
/// Volume-context key that may supply a bind-mount source directly.
pub const VOLUME_CONTEXT_DISK_MOUNT: &str = "diskMount";

/// Topology segment key for the pool a node or volume belongs to.
pub const TOPOLOGY_POOL_ID: &str = "topology.k8s.xenorchestra/pool_id";
/// Topology segment key for the physical host running a node.
pub const TOPOLOGY_HOST_ID: &str = "topology.k8s.xenorchestra/host_id";

/// Filesystem used when a mount capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Opaque key-value map handed from `ControllerPublishVolume` to
/// `NodeStageVolume`.
pub type PublishContext = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume. For this plugin it is the VDI
/// UUID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed, mirroring the CSI access modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// How the workload consumes the volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Raw block device. Never supported by this plugin.
    Block,
    /// Filesystem mount.
    Mount {
        /// Filesystem type; empty means [`DEFAULT_FS_TYPE`].
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    /// Single-node-writer filesystem capability with the given fs type.
    pub fn mount(fs_type: impl Into<String>) -> Self {
        Self {
            access_type: AccessType::Mount {
                fs_type: fs_type.into(),
                mount_flags: Vec::new(),
            },
            access_mode: AccessMode::SingleNodeWriter,
        }
    }

    /// Single-node-writer raw block capability.
    pub fn block() -> Self {
        Self {
            access_type: AccessType::Block,
            access_mode: AccessMode::SingleNodeWriter,
        }
    }

    /// Requested filesystem type, falling back to [`DEFAULT_FS_TYPE`].
    /// `None` for block access.
    pub fn fs_type(&self) -> Option<&str> {
        match &self.access_type {
            AccessType::Mount { fs_type, .. } if fs_type.is_empty() => Some(DEFAULT_FS_TYPE),
            AccessType::Mount { fs_type, .. } => Some(fs_type),
            AccessType::Block => None,
        }
    }

    /// Mount flags for mount access, empty for block access.
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount("")
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Metadata for a pre-existing volume as reported to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Virtual size in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints; a volume is only reachable from its own pool.
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Result of `ControllerGetVolume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub volume: Volume,
    /// Nodes the volume is currently connected to.
    #[serde(default)]
    pub published_node_ids: Vec<String>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.k8s.xenorchestra/pool_id": "..."}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Snapshot metadata. Snapshots are not supported; the type exists so the
/// message envelope can describe the unimplemented RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: VolumeId,
    pub ready_to_use: bool,
}

/// Usage statistics for a published volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

// ---------------------------------------------------------------------------
// Controller requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Human-readable name for the volume.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters forwarded to the backend.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to attach a volume to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    /// Volume (VDI UUID) to attach.
    pub volume_id: VolumeId,
    /// Node (VM UUID) to attach to.
    pub node_id: String,
    /// Requested capability; required.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to detach a volume from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to stage (format and mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point shared by every workload on the node.
    pub staging_target_path: String,
    /// Requested capability; required.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Context returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: PublishContext,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to unstage a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: VolumeId,
    pub staging_target_path: String,
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount). May be
    /// empty when the volume context carries `diskMount`.
    #[serde(default)]
    pub staging_target_path: String,
    /// Per-workload target path.
    pub target_path: String,
    /// Requested capability; required.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub publish_context: PublishContext,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to remove a workload bind mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub target_path: String,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi.xenorchestra.vates.tech"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPCs the Controller service supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    PublishUnpublishVolume,
    GetVolume,
}

/// RPCs the Node service supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier (VM UUID).
    pub node_id: String,
    /// Maximum number of volumes the node can host, `0` for no limit.
    pub max_volumes: u64,
    /// Topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
