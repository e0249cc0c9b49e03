//! Xen Orchestra hypervisor client adapter.
//!
//! [`XoApi`] is the narrow capability set the controllers need from the
//! hypervisor: look up VDIs, VMs and VBDs, attach a VDI to a VM, and
//! connect/disconnect an existing VBD. [`XoClient`] is the production
//! implementation speaking JSON-RPC to Xen Orchestra; [`poller`] turns the
//! asynchronous `vm.attachDisk` completion into a bounded synchronous wait.
//!
//! Nothing returned by this module is cached: every call goes to the
//! hypervisor, which owns VDI and VBD state.

pub mod client;
pub mod poller;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::CsiError;

pub use client::XoClient;
pub use poller::{AttachPoll, wait_for_attachment};

// ---------------------------------------------------------------------------
// Hypervisor objects
// ---------------------------------------------------------------------------

/// A virtual disk image (the CSI volume).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vdi {
    pub id: String,
    #[serde(rename = "$pool")]
    pub pool_id: String,
    /// Virtual size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub name_label: String,
}

/// A virtual machine (the CSI node).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vm {
    pub id: String,
    #[serde(rename = "$pool")]
    pub pool_id: String,
    /// Physical host running the VM, or the pool when halted.
    #[serde(rename = "$container", default)]
    pub host_id: String,
    #[serde(default)]
    pub name_label: String,
}

/// A virtual block device binding one VDI to one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vbd {
    pub id: String,
    #[serde(rename = "VDI")]
    pub vdi_id: String,
    #[serde(rename = "VM")]
    pub vm_id: String,
    /// Whether the VBD is currently plugged into the running VM.
    #[serde(default)]
    pub attached: bool,
    /// Guest device name (`xvdb`, ...). Assigned once plugged.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub device: Option<String>,
}

impl Vbd {
    /// Plugged and carrying a device name.
    pub fn is_ready(&self) -> bool {
        self.attached && self.device.is_some()
    }

    pub fn device_name(&self) -> &str {
        self.device.as_deref().unwrap_or_default()
    }
}

fn empty_as_none<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(de)?;
    Ok(value.filter(|s| !s.is_empty()))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures talking to Xen Orchestra.
#[derive(Debug, Error)]
pub enum XoError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("xo api error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{method} was rejected: {reason}")]
    Rejected { method: String, reason: String },

    #[error("timed out after {secs}s waiting for VDI {vdi} to be attached to VM {vm}")]
    Timeout { vdi: String, vm: String, secs: u64 },
}

impl From<XoError> for CsiError {
    fn from(e: XoError) -> Self {
        match e {
            XoError::Timeout { .. } => CsiError::Timeout(e.to_string()),
            other => CsiError::backend(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Client capability
// ---------------------------------------------------------------------------

/// Hypervisor operations used by the controllers.
#[async_trait]
pub trait XoApi: Send + Sync {
    /// Look up a VDI by UUID.
    async fn get_vdi(&self, vdi_id: &str) -> Result<Vdi, XoError>;

    /// Look up a VM by UUID.
    async fn get_vm(&self, vm_id: &str) -> Result<Vm, XoError>;

    /// Every VBD referencing `vdi_id`, across all VMs of the pool.
    async fn list_vbds_for_vdi(&self, vdi_id: &str) -> Result<Vec<Vbd>, XoError>;

    /// The VBD binding `vdi_id` to `vm_id`.
    async fn get_vbd(&self, vdi_id: &str, vm_id: &str) -> Result<Vbd, XoError> {
        self.list_vbds_for_vdi(vdi_id)
            .await?
            .into_iter()
            .find(|vbd| vbd.vm_id == vm_id)
            .ok_or_else(|| XoError::NotFound {
                kind: "VBD",
                id: format!("vdi={vdi_id} vm={vm_id}"),
            })
    }

    /// Create a VBD for `vdi_id` on `vm_id` and plug it. Completion is
    /// asynchronous: the VBD may not carry a device yet when this returns.
    async fn attach_vdi(&self, vdi_id: &str, vm_id: &str) -> Result<(), XoError>;

    /// Plug an existing, unplugged VBD.
    async fn connect_vbd(&self, vbd: &Vbd) -> Result<(), XoError>;

    /// Unplug a VBD. Returns once the request is accepted.
    async fn disconnect_vbd(&self, vbd: &Vbd) -> Result<(), XoError>;

    /// Attach `vdi_id` to `vm_id` and wait until the VBD is plugged with a
    /// device name.
    async fn attach_and_wait(
        &self,
        vdi_id: &str,
        vm_id: &str,
        poll: AttachPoll,
    ) -> Result<Vbd, XoError> {
        self.attach_vdi(vdi_id, vm_id).await?;
        wait_for_attachment(self, vdi_id, vm_id, poll).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vbd_from_xo_object() {
        let json = r#"{
            "type": "VBD",
            "id": "vbd-1",
            "VDI": "vdi-1",
            "VM": "vm-1",
            "attached": true,
            "device": "xvdb",
            "bootable": false
        }"#;
        let vbd: Vbd = serde_json::from_str(json).expect("deserialize");
        assert_eq!(vbd.vdi_id, "vdi-1");
        assert_eq!(vbd.vm_id, "vm-1");
        assert!(vbd.is_ready());
        assert_eq!(vbd.device_name(), "xvdb");
    }

    #[test]
    fn vbd_without_device_is_not_ready() {
        for device in [r#"null"#, r#""""#] {
            let json = format!(
                r#"{{"id":"vbd-1","VDI":"vdi-1","VM":"vm-1","attached":true,"device":{device}}}"#
            );
            let vbd: Vbd = serde_json::from_str(&json).expect("deserialize");
            assert!(vbd.device.is_none());
            assert!(!vbd.is_ready());
        }
    }

    #[test]
    fn vm_and_vdi_from_xo_objects() {
        let vm: Vm = serde_json::from_str(
            r#"{"type":"VM","id":"vm-1","$pool":"pool-1","$container":"host-1","name_label":"k8s-worker"}"#,
        )
        .expect("deserialize vm");
        assert_eq!(vm.pool_id, "pool-1");
        assert_eq!(vm.host_id, "host-1");

        let vdi: Vdi = serde_json::from_str(
            r#"{"type":"VDI","id":"vdi-1","$pool":"pool-1","size":10737418240}"#,
        )
        .expect("deserialize vdi");
        assert_eq!(vdi.size, 10 * 1024 * 1024 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_and_wait_returns_plugged_vbd() {
        let xo = crate::testing::FakeXo::new()
            .with_vdi("v1", "p1")
            .with_vm("n1", "p1");
        xo.set_ready_after_polls(2);

        let vbd = xo
            .attach_and_wait("v1", "n1", AttachPoll::default())
            .await
            .expect("attach");
        assert!(vbd.is_ready());
        assert_eq!(vbd.vm_id, "n1");
        assert_eq!(xo.mutations(), vec!["attach:v1:n1".to_owned()]);
    }

    #[test]
    fn timeout_maps_to_csi_timeout() {
        let err: CsiError = XoError::Timeout {
            vdi: "v".into(),
            vm: "n".into(),
            secs: 120,
        }
        .into();
        assert!(matches!(err, CsiError::Timeout(_)));

        let err: CsiError = XoError::NotFound {
            kind: "VDI",
            id: "v".into(),
        }
        .into();
        assert!(matches!(err, CsiError::BackendError(_)));
    }
}
