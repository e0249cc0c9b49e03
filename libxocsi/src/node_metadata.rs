//! Node identity and topology discovery.
//!
//! The node id is the VM UUID as known to Xen Orchestra. Inside an HVM guest
//! the DMI product UUID matches it, so that is the fallback when the id is
//! not configured. Pool and host come from the hypervisor's record of the VM.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CsiError;
use crate::xo::XoApi;

/// Identity and placement of the node this plugin runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    pub node_id: String,
    pub host_id: String,
    pub pool_id: String,
}

#[async_trait]
pub trait NodeMetadataSource: Send + Sync {
    async fn node_metadata(&self) -> Result<NodeMetadata, CsiError>;
}

/// Resolves node metadata through the hypervisor API.
pub struct HypervisorNodeMetadata {
    xo: Arc<dyn XoApi>,
    node_id: Option<String>,
    dmi_product_uuid: PathBuf,
}

impl HypervisorNodeMetadata {
    /// * `node_id` — configured VM UUID; read from `dmi_product_uuid` when
    ///   `None`
    pub fn new(
        xo: Arc<dyn XoApi>,
        node_id: Option<String>,
        dmi_product_uuid: impl Into<PathBuf>,
    ) -> Self {
        Self {
            xo,
            node_id: node_id.filter(|id| !id.is_empty()),
            dmi_product_uuid: dmi_product_uuid.into(),
        }
    }

    async fn resolve_node_id(&self) -> Result<String, CsiError> {
        if let Some(id) = &self.node_id {
            return Ok(id.clone());
        }

        let raw = tokio::fs::read_to_string(&self.dmi_product_uuid)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "read product UUID from {}: {e}",
                    self.dmi_product_uuid.display()
                ))
            })?;
        let id = raw.trim().to_lowercase();
        if id.is_empty() {
            return Err(CsiError::Internal("product UUID is empty".into()));
        }
        Ok(id)
    }
}

#[async_trait]
impl NodeMetadataSource for HypervisorNodeMetadata {
    async fn node_metadata(&self) -> Result<NodeMetadata, CsiError> {
        let node_id = self.resolve_node_id().await?;
        let vm = self
            .xo
            .get_vm(&node_id)
            .await
            .map_err(|e| CsiError::Internal(format!("find VM {node_id}: {e}")))?;

        debug!(%node_id, pool = %vm.pool_id, host = %vm.host_id, "resolved node metadata");
        Ok(NodeMetadata {
            node_id,
            host_id: vm.host_id,
            pool_id: vm.pool_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeXo;

    #[tokio::test]
    async fn configured_node_id() {
        let xo = Arc::new(FakeXo::new().with_vm_on_host("vm-1", "pool-1", "host-1"));
        let src = HypervisorNodeMetadata::new(xo, Some("vm-1".into()), "/nonexistent");
        let md = src.node_metadata().await.unwrap();
        assert_eq!(
            md,
            NodeMetadata {
                node_id: "vm-1".into(),
                host_id: "host-1".into(),
                pool_id: "pool-1".into(),
            }
        );
    }

    #[tokio::test]
    async fn node_id_from_dmi() {
        let tmp = tempfile::tempdir().unwrap();
        let dmi = tmp.path().join("product_uuid");
        tokio::fs::write(&dmi, "EC2A-VM-1\n").await.unwrap();

        let xo = Arc::new(FakeXo::new().with_vm_on_host("ec2a-vm-1", "pool-1", "host-2"));
        let src = HypervisorNodeMetadata::new(xo, None, &dmi);
        let md = src.node_metadata().await.unwrap();
        assert_eq!(md.node_id, "ec2a-vm-1");
        assert_eq!(md.host_id, "host-2");
    }

    #[tokio::test]
    async fn empty_dmi_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dmi = tmp.path().join("product_uuid");
        tokio::fs::write(&dmi, "  \n").await.unwrap();

        let src = HypervisorNodeMetadata::new(Arc::new(FakeXo::new()), Some(String::new()), &dmi);
        let err = src.node_metadata().await.unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)));
    }

    #[tokio::test]
    async fn unknown_vm_is_an_error() {
        let src = HypervisorNodeMetadata::new(Arc::new(FakeXo::new()), Some("vm-x".into()), "/x");
        assert!(src.node_metadata().await.is_err());
    }
}
