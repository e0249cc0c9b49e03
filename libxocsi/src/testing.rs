//! In-memory stand-ins for the hypervisor, the mount table and the node
//! registry, used by unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::mount::{MountEntry, MountRecord, Mounter, record_for};
use crate::node_metadata::{NodeMetadata, NodeMetadataSource};
use crate::xo::{Vbd, Vdi, Vm, XoApi, XoError};

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct XoState {
    vdis: HashMap<String, Vdi>,
    vms: HashMap<String, Vm>,
    vbds: Vec<Vbd>,
    /// VBD id -> lookups left before it becomes ready.
    pending: HashMap<String, usize>,
    ready_after_polls: usize,
    fail_lookups: usize,
    lookup_delay: Duration,
    lookups: usize,
    next_vbd: usize,
    mutations: Vec<String>,
}

impl XoState {
    fn next_device(&self, vm_id: &str) -> String {
        let used = self
            .vbds
            .iter()
            .filter(|v| v.vm_id == vm_id && v.device.is_some())
            .count();
        format!("xvd{}", (b'b' + used as u8) as char)
    }

    fn make_ready(&mut self, vbd_id: &str) {
        let Some(idx) = self.vbds.iter().position(|v| v.id == vbd_id) else {
            return;
        };
        if self.vbds[idx].device.is_none() {
            let device = self.next_device(&self.vbds[idx].vm_id.clone());
            self.vbds[idx].device = Some(device);
        }
        self.vbds[idx].attached = true;
    }
}

/// Fake Xen Orchestra. Newly attached VBDs become ready after a
/// configurable number of lookups.
#[derive(Default)]
pub struct FakeXo {
    state: Mutex<XoState>,
}

impl FakeXo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vdi(self, id: &str, pool: &str) -> Self {
        self.state.lock().unwrap().vdis.insert(
            id.into(),
            Vdi {
                id: id.into(),
                pool_id: pool.into(),
                size: 1 << 30,
                name_label: format!("disk {id}"),
            },
        );
        self
    }

    pub fn with_vm(self, id: &str, pool: &str) -> Self {
        self.with_vm_on_host(id, pool, &format!("host-of-{id}"))
    }

    pub fn with_vm_on_host(self, id: &str, pool: &str, host: &str) -> Self {
        self.state.lock().unwrap().vms.insert(
            id.into(),
            Vm {
                id: id.into(),
                pool_id: pool.into(),
                host_id: host.into(),
                name_label: id.into(),
            },
        );
        self
    }

    pub fn with_vbd(self, id: &str, vdi: &str, vm: &str, attached: bool, device: Option<&str>) -> Self {
        self.state.lock().unwrap().vbds.push(Vbd {
            id: id.into(),
            vdi_id: vdi.into(),
            vm_id: vm.into(),
            attached,
            device: device.map(str::to_owned),
        });
        self
    }

    pub fn set_ready_after_polls(&self, n: usize) {
        self.state.lock().unwrap().ready_after_polls = n;
    }

    pub fn fail_next_lookups(&self, n: usize) {
        self.state.lock().unwrap().fail_lookups = n;
    }

    /// Make every VBD listing take `delay` before answering.
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.state.lock().unwrap().lookup_delay = delay;
    }

    /// Number of VBD listings served or started so far.
    pub fn lookups(&self) -> usize {
        self.state.lock().unwrap().lookups
    }

    /// Every mutating call made so far, e.g. `attach:v1:n1`.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn vbds(&self) -> Vec<Vbd> {
        self.state.lock().unwrap().vbds.clone()
    }
}

#[async_trait]
impl XoApi for FakeXo {
    async fn get_vdi(&self, vdi_id: &str) -> Result<Vdi, XoError> {
        self.state
            .lock()
            .unwrap()
            .vdis
            .get(vdi_id)
            .cloned()
            .ok_or_else(|| XoError::NotFound {
                kind: "VDI",
                id: vdi_id.into(),
            })
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Vm, XoError> {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(vm_id)
            .cloned()
            .ok_or_else(|| XoError::NotFound {
                kind: "VM",
                id: vm_id.into(),
            })
    }

    async fn list_vbds_for_vdi(&self, vdi_id: &str) -> Result<Vec<Vbd>, XoError> {
        let delay = {
            let mut st = self.state.lock().unwrap();
            st.lookups += 1;
            st.lookup_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut st = self.state.lock().unwrap();
        if st.fail_lookups > 0 {
            st.fail_lookups -= 1;
            return Err(XoError::Rpc {
                code: -1,
                message: "connection reset".into(),
            });
        }

        let mut ready = Vec::new();
        for (id, left) in st.pending.iter_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                ready.push(id.clone());
            }
        }
        for id in ready {
            st.pending.remove(&id);
            st.make_ready(&id);
        }

        Ok(st
            .vbds
            .iter()
            .filter(|v| v.vdi_id == vdi_id)
            .cloned()
            .collect())
    }

    async fn attach_vdi(&self, vdi_id: &str, vm_id: &str) -> Result<(), XoError> {
        let mut st = self.state.lock().unwrap();
        st.mutations.push(format!("attach:{vdi_id}:{vm_id}"));
        if !st.vdis.contains_key(vdi_id) || !st.vms.contains_key(vm_id) {
            return Err(XoError::Rejected {
                method: "vm.attachDisk".into(),
                reason: "unknown VDI or VM".into(),
            });
        }

        st.next_vbd += 1;
        let id = format!("vbd-new-{}", st.next_vbd);
        st.vbds.push(Vbd {
            id: id.clone(),
            vdi_id: vdi_id.into(),
            vm_id: vm_id.into(),
            attached: false,
            device: None,
        });
        match st.ready_after_polls {
            0 => st.make_ready(&id),
            n => {
                st.pending.insert(id, n);
            }
        }
        Ok(())
    }

    async fn connect_vbd(&self, vbd: &Vbd) -> Result<(), XoError> {
        let mut st = self.state.lock().unwrap();
        st.mutations.push(format!("connect:{}", vbd.id));
        st.make_ready(&vbd.id);
        Ok(())
    }

    async fn disconnect_vbd(&self, vbd: &Vbd) -> Result<(), XoError> {
        let mut st = self.state.lock().unwrap();
        st.mutations.push(format!("disconnect:{}", vbd.id));
        if let Some(v) = st.vbds.iter_mut().find(|v| v.id == vbd.id) {
            v.attached = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mount table
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MountState {
    entries: Vec<MountEntry>,
    calls: Vec<String>,
    fail_mount: bool,
    fail_remove_dir_once: bool,
}

/// Fake mount executor. Mounts live in an in-memory table; directories are
/// real so tests point it at a temporary directory.
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<MountState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `device` (e.g. `/dev/xvdb`) is mounted at `path`.
    pub fn with_mount(self, device: &str, path: &Path) -> Self {
        self.state.lock().unwrap().entries.push(MountEntry {
            device: device.into(),
            mount_point: path.to_path_buf(),
            fs_type: "ext4".into(),
            options: vec!["rw".into()],
        });
        self
    }

    pub fn fail_mounts(&self) {
        self.state.lock().unwrap().fail_mount = true;
    }

    pub fn fail_next_remove_dir(&self) {
        self.state.lock().unwrap().fail_remove_dir_once = true;
    }

    /// Calls made so far, e.g. `format_and_mount /dev/xvdb /stage ext4`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn push(&self, source: &Path, target: &Path, fs_type: &str, options: &[String]) {
        let mut st = self.state.lock().unwrap();
        // A bind mount shows the backing device of its source.
        let device = st
            .entries
            .iter()
            .find(|e| options.iter().any(|o| o == "bind") && e.mount_point == source)
            .map(|e| e.device.clone())
            .unwrap_or_else(|| source.display().to_string());
        st.entries.push(MountEntry {
            device,
            mount_point: target.to_path_buf(),
            fs_type: fs_type.into(),
            options: options.to_vec(),
        });
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn format_and_mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!(
                "format_and_mount {} {} {fs_type}",
                source.display(),
                target.display()
            ));
            if st.fail_mount {
                return Err(CsiError::MountFailed {
                    path: target.display().to_string(),
                    reason: "injected".into(),
                });
            }
        }
        std::fs::create_dir_all(target).map_err(CsiError::internal)?;
        self.push(source, target, fs_type, options);
        Ok(())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        {
            let mut st = self.state.lock().unwrap();
            st.calls.push(format!(
                "mount {} {} {}",
                source.display(),
                target.display(),
                options.join(",")
            ));
            if st.fail_mount {
                return Err(CsiError::MountFailed {
                    path: target.display().to_string(),
                    reason: "injected".into(),
                });
            }
        }
        self.push(source, target, fs_type, options);
        Ok(())
    }

    async fn cleanup_mount_point(&self, target: &Path) -> Result<(), CsiError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("cleanup {}", target.display()));
        if let Some(idx) = st.entries.iter().rposition(|e| e.mount_point == target) {
            st.entries.remove(idx);
        }
        if !target.exists() {
            return Ok(());
        }
        if std::mem::take(&mut st.fail_remove_dir_once) {
            return Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: "remove dir: injected".into(),
            });
        }
        std::fs::remove_dir(target).map_err(|e| CsiError::UnmountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn device_path(&self, device_name: &str, _vbd_id: &str) -> PathBuf {
        Path::new("/dev").join(device_name)
    }

    async fn mount_record(&self, mount_path: &Path) -> Result<MountRecord, CsiError> {
        Ok(record_for(&self.state.lock().unwrap().entries, mount_path))
    }

    async fn is_mount_point(&self, target: &Path) -> Result<bool, CsiError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .entries
            .iter()
            .any(|e| e.mount_point == target))
    }
}

// ---------------------------------------------------------------------------
// Node registry
// ---------------------------------------------------------------------------

pub struct StaticNodeMetadata(pub NodeMetadata);

#[async_trait]
impl NodeMetadataSource for StaticNodeMetadata {
    async fn node_metadata(&self) -> Result<NodeMetadata, CsiError> {
        Ok(self.0.clone())
    }
}
