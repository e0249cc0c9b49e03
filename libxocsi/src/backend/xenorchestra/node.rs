//! Node-side volume lifecycle: stage the attached device once per node and
//! bind-mount it into each workload.
//!
//! The mount table is the only source of truth. Each call reads it, decides
//! and acts under a lock on the path it touches, so retries after a partial
//! failure converge.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::capability::is_valid_capability;
use crate::error::CsiError;
use crate::lock::KeyedLocks;
use crate::mount::Mounter;
use crate::node::CsiNode;
use crate::node_metadata::NodeMetadataSource;
use crate::types::*;

/// Node RPCs backed by the local mount table.
pub struct NodeController {
    mounter: Arc<dyn Mounter>,
    metadata: Arc<dyn NodeMetadataSource>,
    max_volumes: u64,
    /// Keyed by staging or target path.
    locks: KeyedLocks,
}

impl NodeController {
    pub fn new(
        mounter: Arc<dyn Mounter>,
        metadata: Arc<dyn NodeMetadataSource>,
        max_volumes: u64,
    ) -> Self {
        Self {
            mounter,
            metadata,
            max_volumes,
            locks: KeyedLocks::new(),
        }
    }
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

#[async_trait]
impl CsiNode for NodeController {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability is required".into()))?;
        let fs_type = cap.fs_type().ok_or_else(|| {
            CsiError::InvalidArgument("block access type is not supported".into())
        })?;
        let device = req
            .publish_context
            .get(PUBLISH_CONTEXT_DEVICE)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!(
                    "publish context has no {PUBLISH_CONTEXT_DEVICE:?} entry"
                ))
            })?;
        let vbd_id = req
            .publish_context
            .get(PUBLISH_CONTEXT_VBD)
            .map(String::as_str)
            .unwrap_or_default();

        let _guard = self.locks.lock(&req.staging_target_path).await;

        let staging = Path::new(&req.staging_target_path);
        let current = self.mounter.mount_record(staging).await?;
        if current.device == *device {
            debug!(%device, "volume already staged");
            return Ok(());
        }
        if current.is_mounted() {
            return Err(CsiError::FailedPrecondition(format!(
                "{} already has device {} mounted, expected {device}",
                req.staging_target_path, current.device
            )));
        }

        let source = self.mounter.device_path(device, vbd_id);
        self.mounter
            .format_and_mount(&source, staging, fs_type, cap.mount_flags())
            .await?;
        info!(device = %source.display(), fs_type, "volume staged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.staging_target_path, "staging target path")?;

        let _guard = self.locks.lock(&req.staging_target_path).await;

        let staging = Path::new(&req.staging_target_path);
        let current = self.mounter.mount_record(staging).await?;
        match current.ref_count {
            0 => debug!("nothing mounted at staging path"),
            1 => {
                self.mounter.cleanup_mount_point(staging).await?;
                info!(device = %current.device, "volume unstaged");
            }
            n => debug!(refs = n, device = %current.device, "device still in use, keeping staging mount"),
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.target_path, "target path")?;
        if req.volume_capability.is_none() {
            return Err(CsiError::InvalidArgument("volume capability is required".into()));
        }
        if !is_valid_capability(req.volume_capability.as_ref()) {
            return Err(CsiError::InvalidArgument("unsupported volume capability".into()));
        }
        let fs_type = req
            .volume_capability
            .as_ref()
            .and_then(VolumeCapability::fs_type)
            .unwrap_or(DEFAULT_FS_TYPE);

        let source = if !req.staging_target_path.is_empty() {
            req.staging_target_path.as_str()
        } else {
            req.volume_context
                .get(VOLUME_CONTEXT_DISK_MOUNT)
                .map(String::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    CsiError::InvalidArgument(
                        "staging target path or diskMount volume context is required".into(),
                    )
                })?
        };

        let _guard = self.locks.lock(&req.target_path).await;

        let target = Path::new(&req.target_path);
        tokio::fs::create_dir_all(target).await.map_err(|e| {
            CsiError::Internal(format!("create target {}: {e}", req.target_path))
        })?;
        if self.mounter.is_mount_point(target).await? {
            debug!("target already mounted");
            return Ok(());
        }

        let mut options = Vec::with_capacity(2);
        if req.read_only {
            options.push("ro".to_owned());
        }
        options.push("bind".to_owned());

        self.mounter
            .mount(Path::new(source), target, fs_type, &options)
            .await?;
        info!(source, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
        require(req.volume_id.as_str(), "volume id")?;
        require(&req.target_path, "target path")?;

        let _guard = self.locks.lock(&req.target_path).await;

        self.mounter
            .cleanup_mount_point(Path::new(&req.target_path))
            .await?;
        info!("volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        let md = self.metadata.node_metadata().await?;
        let mut topology = Topology::default();
        topology.segments.insert(TOPOLOGY_POOL_ID.to_owned(), md.pool_id);
        topology.segments.insert(TOPOLOGY_HOST_ID.to_owned(), md.host_id);

        Ok(NodeInfo {
            node_id: md.node_id,
            max_volumes: self.max_volumes,
            accessible_topology: Some(topology),
        })
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_volume_stats(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        Err(CsiError::unimplemented("NodeGetVolumeStats"))
    }

    async fn node_expand_volume(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("NodeExpandVolume"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;
    use crate::error::Code;
    use crate::node_metadata::NodeMetadata;
    use crate::testing::{FakeMounter, StaticNodeMetadata};

    fn node(mounter: &Arc<FakeMounter>) -> NodeController {
        let md = StaticNodeMetadata(NodeMetadata {
            node_id: "n1".into(),
            host_id: "h1".into(),
            pool_id: "p1".into(),
        });
        NodeController::new(mounter.clone(), Arc::new(md), 16)
    }

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    fn stage_req(staging: &Path, device: Option<&str>) -> NodeStageVolumeRequest {
        let mut publish_context = PublishContext::new();
        if let Some(device) = device {
            publish_context.insert(PUBLISH_CONTEXT_DEVICE.into(), device.into());
            publish_context.insert(PUBLISH_CONTEXT_VBD.into(), "vbd-1".into());
        }
        NodeStageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: path_str(staging),
            volume_capability: Some(VolumeCapability::mount("")),
            publish_context,
            volume_context: HashMap::new(),
        }
    }

    fn unstage_req(staging: &Path) -> NodeUnstageVolumeRequest {
        NodeUnstageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: path_str(staging),
        }
    }

    fn publish_req(staging: &Path, target: &Path) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: path_str(staging),
            target_path: path_str(target),
            volume_capability: Some(VolumeCapability::mount("ext4")),
            read_only: false,
            publish_context: PublishContext::new(),
            volume_context: HashMap::new(),
        }
    }

    fn unpublish_req(target: &Path) -> NodeUnpublishVolumeRequest {
        NodeUnpublishVolumeRequest {
            volume_id: "v1".into(),
            target_path: path_str(target),
        }
    }

    fn paths(tmp: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (tmp.path().join("stage/v1"), tmp.path().join("pods/p1/mount"))
    }

    #[tokio::test]
    async fn stage_formats_and_mounts_with_default_fs() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, _) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());

        node(&mounter).stage_volume(stage_req(&stage, Some("xvdb"))).await.unwrap();

        assert_eq!(
            mounter.calls(),
            vec![format!("format_and_mount /dev/xvdb {} ext4", stage.display())]
        );
        assert!(stage.is_dir());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_stages_mount_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, _) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());
        let node = Arc::new(node(&mounter));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let node = Arc::clone(&node);
                let req = stage_req(&stage, Some("xvdb"));
                tokio::spawn(async move { node.stage_volume(req).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mounts = mounter
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("format_and_mount"))
            .count();
        assert_eq!(mounts, 1);
    }

    #[tokio::test]
    async fn stage_same_device_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, _) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new().with_mount("/dev/xvdb", &stage));

        node(&mounter).stage_volume(stage_req(&stage, Some("xvdb"))).await.unwrap();

        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn stage_rejects_other_device() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, _) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new().with_mount("/dev/xvdc", &stage));

        let err = node(&mounter)
            .stage_volume(stage_req(&stage, Some("xvdb")))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn stage_validates_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, _) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());
        let n = node(&mounter);

        let mut block = stage_req(&stage, Some("xvdb"));
        block.volume_capability = Some(VolumeCapability::block());
        let mut no_cap = stage_req(&stage, Some("xvdb"));
        no_cap.volume_capability = None;
        let mut no_path = stage_req(&stage, Some("xvdb"));
        no_path.staging_target_path.clear();

        for req in [stage_req(&stage, None), block, no_cap, no_path] {
            let err = n.stage_volume(req).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
        }
        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn stage_mount_failure_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, _) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());
        mounter.fail_mounts();

        let err = node(&mounter)
            .stage_volume(stage_req(&stage, Some("xvdb")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn unstage_only_unmounts_last_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, target) = paths(&tmp);

        // Nothing mounted.
        let mounter = Arc::new(FakeMounter::new());
        node(&mounter).unstage_volume(unstage_req(&stage)).await.unwrap();
        assert!(mounter.calls().is_empty());

        // Still bind-mounted into a workload.
        let mounter = Arc::new(
            FakeMounter::new()
                .with_mount("/dev/xvdb", &stage)
                .with_mount("/dev/xvdb", &target),
        );
        node(&mounter).unstage_volume(unstage_req(&stage)).await.unwrap();
        assert!(mounter.calls().is_empty());

        // Last reference.
        let mounter = Arc::new(FakeMounter::new().with_mount("/dev/xvdb", &stage));
        node(&mounter).unstage_volume(unstage_req(&stage)).await.unwrap();
        assert_eq!(mounter.calls(), vec![format!("cleanup {}", stage.display())]);
    }

    #[tokio::test]
    async fn publish_bind_mounts_staging_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, target) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());
        let n = node(&mounter);

        n.stage_volume(stage_req(&stage, Some("xvdb"))).await.unwrap();
        n.publish_volume(publish_req(&stage, &target)).await.unwrap();
        n.publish_volume(publish_req(&stage, &target)).await.unwrap();

        let calls = mounter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            format!("mount {} {} bind", stage.display(), target.display())
        );
        assert!(target.is_dir());

        // The bind mount shares the staged device.
        let record = mounter.mount_record(&stage).await.unwrap();
        assert_eq!(record.device, "xvdb");
        assert_eq!(record.ref_count, 2);
    }

    #[tokio::test]
    async fn publish_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, target) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());

        let mut req = publish_req(&stage, &target);
        req.read_only = true;
        node(&mounter).publish_volume(req).await.unwrap();

        assert_eq!(
            mounter.calls(),
            vec![format!("mount {} {} ro,bind", stage.display(), target.display())]
        );
    }

    #[tokio::test]
    async fn publish_from_disk_mount_context() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, target) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());

        let mut req = publish_req(Path::new(""), &target);
        req.volume_context
            .insert(VOLUME_CONTEXT_DISK_MOUNT.into(), "/mnt/disk".into());
        node(&mounter).publish_volume(req).await.unwrap();

        assert_eq!(
            mounter.calls(),
            vec![format!("mount /mnt/disk {} bind", target.display())]
        );
    }

    #[tokio::test]
    async fn publish_validates_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, target) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());
        let n = node(&mounter);

        let no_source = publish_req(Path::new(""), &target);
        let mut block = publish_req(&stage, &target);
        block.volume_capability = Some(VolumeCapability::block());
        let mut shared = publish_req(&stage, &target);
        shared.volume_capability = Some(VolumeCapability {
            access_mode: AccessMode::MultiNodeReaderOnly,
            ..VolumeCapability::mount("ext4")
        });
        let mut no_target = publish_req(&stage, &target);
        no_target.target_path.clear();

        for req in [no_source, block, shared, no_target] {
            let err = n.publish_volume(req).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
        }
        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn unpublish_converges_from_any_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, target) = paths(&tmp);
        let mounter = Arc::new(FakeMounter::new());
        let n = node(&mounter);

        // Absent.
        n.unpublish_volume(unpublish_req(&target)).await.unwrap();
        assert!(!target.exists());

        // Plain directory.
        std::fs::create_dir_all(&target).unwrap();
        n.unpublish_volume(unpublish_req(&target)).await.unwrap();
        assert!(!target.exists());

        // Mounted, with the directory removal failing once.
        n.publish_volume(publish_req(&stage, &target)).await.unwrap();
        mounter.fail_next_remove_dir();
        assert!(n.unpublish_volume(unpublish_req(&target)).await.is_err());
        assert!(!mounter.is_mount_point(&target).await.unwrap());
        n.unpublish_volume(unpublish_req(&target)).await.unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn get_info_reports_topology() {
        let mounter = Arc::new(FakeMounter::new());
        let info = node(&mounter).get_info().await.unwrap();

        assert_eq!(info.node_id, "n1");
        assert_eq!(info.max_volumes, 16);
        let topo = info.accessible_topology.unwrap();
        assert_eq!(topo.segments[TOPOLOGY_POOL_ID], "p1");
        assert_eq!(topo.segments[TOPOLOGY_HOST_ID], "h1");
    }

    #[tokio::test]
    async fn stats_and_expand_are_unimplemented() {
        let n = node(&Arc::new(FakeMounter::new()));
        let id = VolumeId::from("v1");
        assert_eq!(
            n.get_volume_stats(&id, "/x").await.unwrap_err().code(),
            Code::Unimplemented
        );
        assert_eq!(
            n.node_expand_volume(&id, "/x", 1).await.unwrap_err().code(),
            Code::Unimplemented
        );
    }
}
