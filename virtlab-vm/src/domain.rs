//! A provisioned VM and its lifecycle, including live snapshots and reverts.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use virtlab_core::error::{VirtlabError, VirtlabResult};

use crate::env::Backend;
use crate::hypervisor::DomainState;
use crate::remote::SHORT_TIMEOUT;
use crate::types::{DiskFormat, SnapshotDisk, VmSpec};

pub struct Vm {
    name: String,
    spec: RwLock<VmSpec>,
    backend: Arc<Backend>,
    virt_dir: PathBuf,
}

impl Vm {
    pub fn new(spec: VmSpec, backend: Arc<Backend>, virt_dir: PathBuf) -> Self {
        Self {
            name: spec.name.clone(),
            spec: RwLock::new(spec),
            backend,
            virt_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defined(&self) -> VirtlabResult<bool> {
        self.backend.hypervisor.domain_defined(&self.name)
    }

    pub fn state(&self) -> VirtlabResult<DomainState> {
        if !self.defined()? {
            return Ok(DomainState::Down);
        }
        self.backend.hypervisor.domain_state(&self.name)
    }

    pub fn alive(&self) -> VirtlabResult<bool> {
        Ok(self.state()? == DomainState::Running)
    }

    /// Names of the networks this VM is attached to.
    pub fn nets(&self) -> BTreeSet<String> {
        self.spec
            .read()
            .nics
            .iter()
            .map(|nic| nic.net.clone())
            .collect()
    }

    pub fn mgmt_ip(&self) -> Option<Ipv4Addr> {
        self.spec.read().mgmt_ip()
    }

    /// Define and boot the VM. Starting a VM that is already defined is a
    /// no-op.
    pub fn start(&self) -> VirtlabResult<()> {
        if self.defined()? {
            debug!(vm = %self.name, "domain already defined");
            return Ok(());
        }
        info!(vm = %self.name, "starting VM");
        self.backend.hypervisor.create_domain(&self.spec.read())
    }

    /// Hard-stop the VM, undefining it. The disks stay in place.
    pub fn stop(&self) -> VirtlabResult<()> {
        if !self.defined()? {
            return Ok(());
        }
        info!(vm = %self.name, "stopping VM");
        self.backend.hypervisor.destroy_domain(&self.name)
    }

    /// Graceful power-off through the guest, then wait for the domain to go
    /// down.
    pub fn shutdown(&self) -> VirtlabResult<()> {
        let ip = self.require_mgmt_ip()?;
        info!(vm = %self.name, "shutting down VM");
        self.backend.remote.ssh(ip, &["poweroff"])?;
        self.wait_for_state(DomainState::Down, SHORT_TIMEOUT)
    }

    /// Reboot through the guest. Returns once the command is issued.
    pub fn reboot(&self) -> VirtlabResult<()> {
        let ip = self.require_mgmt_ip()?;
        info!(vm = %self.name, "rebooting VM");
        self.backend.remote.ssh(ip, &["reboot"])?;
        Ok(())
    }

    pub fn wait_for_ssh(&self, timeout: Duration) -> VirtlabResult<()> {
        let ip = self.require_mgmt_ip()?;
        self.backend.remote.wait_for_ssh(ip, timeout)
    }

    fn require_mgmt_ip(&self) -> VirtlabResult<Ipv4Addr> {
        self.mgmt_ip().ok_or_else(|| VirtlabError::Unsupported {
            operation: format!("guest access to VM '{}' without a management address", self.name),
        })
    }

    fn wait_for_state(&self, target: DomainState, timeout: Duration) -> VirtlabResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state()? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VirtlabError::Timeout {
                    operation: format!("waiting for VM '{}' to reach {target:?}", self.name),
                    duration: timeout,
                });
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.spec.read().snapshots.contains_key(name)
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.spec.read().snapshots.keys().cloned().collect()
    }

    /// Take a snapshot of the VM's copy-on-write disks. Only running VMs can
    /// be snapshotted; the guest is synced first so the frozen layers are
    /// consistent.
    pub fn create_snapshot(&self, name: &str) -> VirtlabResult<()> {
        if !self.alive()? {
            return Err(VirtlabError::Unsupported {
                operation: format!("snapshot of stopped VM '{}'", self.name),
            });
        }
        self.create_live_snapshot(name)?;
        self.save()
    }

    fn create_live_snapshot(&self, name: &str) -> VirtlabResult<()> {
        info!(vm = %self.name, snapshot = name, "creating live snapshot");
        self.wait_for_ssh(SHORT_TIMEOUT)?;
        let ip = self.require_mgmt_ip()?;
        self.backend.remote.ssh(ip, &["sync"])?;

        let mut spec = self.spec.write();
        let eligible: Vec<_> = spec
            .disks
            .iter()
            .filter(|disk| disk.format.snapshot_eligible())
            .cloned()
            .collect();
        let layers = self
            .backend
            .hypervisor
            .snapshot_domain_disks(&self.name, name, &eligible)?;

        let mut frozen = Vec::with_capacity(layers.len());
        let mut layer_iter = layers.into_iter();
        for disk in spec
            .disks
            .iter_mut()
            .filter(|disk| disk.format.snapshot_eligible())
        {
            let layer = layer_iter.next().ok_or_else(|| VirtlabError::Internal {
                message: "hypervisor returned fewer layers than disks".into(),
            })?;
            frozen.push(SnapshotDisk {
                path: layer.backing.clone(),
                format: disk.format,
            });
            // The guest now writes to a fresh qcow2 layer regardless of the
            // original format.
            disk.path = Some(layer.path.clone());
            disk.format = DiskFormat::Qcow2;
            reclaim_disk(&layer.path);
        }
        spec.snapshots.insert(name.to_string(), frozen);
        Ok(())
    }

    /// Throw away everything written since `name` was taken and put the VM
    /// back on top of the frozen layers. A running VM is stopped for the
    /// revert and started again afterwards.
    pub fn revert_snapshot(&self, name: &str) -> VirtlabResult<()> {
        let frozen = self
            .spec
            .read()
            .snapshots
            .get(name)
            .cloned()
            .ok_or_else(|| VirtlabError::SnapshotNotFound {
                vm: self.name.clone(),
                snapshot: name.to_string(),
            })?;

        info!(vm = %self.name, snapshot = name, "reverting to snapshot");
        let was_running = self.alive()?;
        if was_running {
            self.stop()?;
        }

        {
            let mut spec = self.spec.write();
            let mut frozen_iter = frozen.iter();
            for disk in spec
                .disks
                .iter_mut()
                .filter(|disk| disk.format.snapshot_eligible())
            {
                let snapshot_disk = frozen_iter.next().ok_or_else(|| VirtlabError::Internal {
                    message: format!("snapshot '{name}' covers fewer disks than the VM has"),
                })?;
                let current = disk.path.clone().ok_or_else(|| VirtlabError::Internal {
                    message: format!("disk '{}' has no resolved path", disk.name),
                })?;
                self.recreate_layer(&current, &snapshot_disk.path)?;
                reclaim_disk(&current);
            }
        }

        self.save()?;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Replace the layer at `current` with a fresh one backed by `base`.
    fn recreate_layer(&self, current: &Path, base: &Path) -> VirtlabResult<()> {
        match fs::remove_file(current) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %current.display(), "layer already gone before revert");
            }
            Err(err) => return Err(err.into()),
        }
        // Backing paths are kept relative when both layers share a
        // directory, so the environment stays relocatable.
        let parent = current.parent();
        let backing = match (parent, base.parent()) {
            (Some(cur_dir), Some(base_dir)) if cur_dir == base_dir => base
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| base.to_string_lossy().into_owned()),
            _ => base.to_string_lossy().into_owned(),
        };
        let target = match parent {
            Some(dir) if !dir.as_os_str().is_empty() => current
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| current.to_path_buf()),
            _ => current.to_path_buf(),
        };
        self.backend
            .qemu_img
            .create_backed(&target, &backing, parent.filter(|p| !p.as_os_str().is_empty()))
    }

    /// Persist the current spec under the environment's state directory.
    pub fn save(&self) -> VirtlabResult<()> {
        let spec = self.spec.read();
        let path = self.virt_dir.join(format!("vm-{}", self.name));
        fs::write(&path, serde_json::to_vec_pretty(&*spec)?)?;
        Ok(())
    }

    pub fn spec(&self) -> VmSpec {
        self.spec.read().clone()
    }
}

/// Loosen permissions on a layer so the hypervisor's qemu process can open
/// it whoever it runs as.
fn reclaim_disk(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
            warn!(path = %path.display(), "could not adjust disk permissions: {err}");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
