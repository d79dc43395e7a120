//! The environment: a working directory full of provisioned networks and
//! VMs, plus the operations that act on the whole fleet.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use virtlab_core::error::{VirtlabError, VirtlabResult};
use virtlab_core::executor::invoke_in_parallel;
use virtlab_core::lease::SubnetLeaseStore;
use virtlab_core::rollback::with_rollback;

use crate::disk::{DiskBuilder, QemuImg};
use crate::domain::Vm;
use crate::hypervisor::Hypervisor;
use crate::network::Network;
use crate::paths::EnvPaths;
use crate::remote::{RemoteExec, LONG_TIMEOUT};
use crate::topology::TopologyBuilder;
use crate::types::{NetworkSpec, TopologySpec, VmSpec};

/// The backends everything in an environment runs against. Bundled so a
/// single mock swap makes the whole engine testable.
pub struct Backend {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub qemu_img: Arc<QemuImg>,
    pub remote: Arc<dyn RemoteExec>,
}

/// Persisted index of what an environment contains.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EnvIndex {
    nets: Vec<String>,
    vms: Vec<String>,
}

pub struct Environment {
    paths: EnvPaths,
    uuid: String,
    leases: SubnetLeaseStore,
    nets: BTreeMap<String, Arc<Network>>,
    vms: BTreeMap<String, Arc<Vm>>,
}

impl Environment {
    /// Provision a new environment under `root` from a declarative spec.
    ///
    /// Provisioning is atomic with respect to failure: if any stage fails,
    /// leased subnets are released and the working directory is removed.
    pub fn provision(
        root: &Path,
        spec: TopologySpec,
        backend: Arc<Backend>,
        leases: SubnetLeaseStore,
    ) -> VirtlabResult<Self> {
        info!(root = %root.display(), "provisioning environment");
        with_rollback(|rollback| {
            if let Some(parent) = root.parent() {
                fs::create_dir_all(parent)?;
            }
            // `create_dir`, not `create_dir_all`: a preexisting directory is
            // refused so the rollback below only ever removes what this call
            // created.
            fs::create_dir(root)?;
            {
                let root = root.to_path_buf();
                // Runs after every other undo, so leases are released before
                // the uuid file they point at disappears.
                rollback.add_first(move || Ok(fs::remove_dir_all(&root)?));
            }

            let paths = EnvPaths::new(root);
            let uuid = Uuid::new_v4().simple().to_string();
            fs::write(paths.uuid(), &uuid)?;
            fs::create_dir_all(paths.images())?;
            fs::create_dir_all(paths.virt())?;

            let mut spec = spec;
            let images_dir = paths.images();
            let disk_builder = DiskBuilder::new(&backend.qemu_img, &images_dir);
            for (vm_name, vm) in spec.domains.iter_mut() {
                for disk in vm.disks.iter_mut() {
                    disk_builder.build(vm_name, disk)?;
                }
            }

            let uuid_path = paths.uuid();
            let topology = TopologyBuilder::new(&leases, &uuid_path).build(spec)?;
            for gateway in &topology.leased_subnets {
                let store = leases.clone();
                let gateway = *gateway;
                rollback.add(move || store.release(gateway));
            }

            let env = Self::assemble(paths, uuid, backend, leases.clone(), topology.nets, topology.domains);
            env.save()?;

            rollback.clear();
            Ok(env)
        })
    }

    /// Load a previously provisioned environment from its working directory.
    pub fn load(
        root: &Path,
        backend: Arc<Backend>,
        leases: SubnetLeaseStore,
    ) -> VirtlabResult<Self> {
        let paths = EnvPaths::new(root);
        let uuid = fs::read_to_string(paths.uuid())?.trim().to_string();
        let index: EnvIndex = serde_json::from_slice(&fs::read(paths.env_index())?)?;

        let mut nets = BTreeMap::new();
        for name in &index.nets {
            let spec: NetworkSpec = serde_json::from_slice(&fs::read(paths.net_spec(name))?)?;
            nets.insert(name.clone(), spec);
        }
        let mut vms = BTreeMap::new();
        for name in &index.vms {
            let spec: VmSpec = serde_json::from_slice(&fs::read(paths.vm_spec(name))?)?;
            vms.insert(name.clone(), spec);
        }

        Ok(Self::assemble(paths, uuid, backend, leases, nets, vms))
    }

    fn assemble(
        paths: EnvPaths,
        uuid: String,
        backend: Arc<Backend>,
        leases: SubnetLeaseStore,
        net_specs: BTreeMap<String, NetworkSpec>,
        vm_specs: BTreeMap<String, VmSpec>,
    ) -> Self {
        let virt_dir = paths.virt();
        let nets = net_specs
            .into_iter()
            .map(|(name, spec)| {
                let net = Network::new(spec, backend.hypervisor.clone(), virt_dir.clone());
                (name, Arc::new(net))
            })
            .collect();
        let vms = vm_specs
            .into_iter()
            .map(|(name, spec)| {
                let vm = Vm::new(spec, backend.clone(), virt_dir.clone());
                (name, Arc::new(vm))
            })
            .collect();
        Self {
            paths,
            uuid,
            leases,
            nets,
            vms,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn nets(&self) -> &BTreeMap<String, Arc<Network>> {
        &self.nets
    }

    pub fn vms(&self) -> &BTreeMap<String, Arc<Vm>> {
        &self.vms
    }

    pub fn vm(&self, name: &str) -> Option<&Arc<Vm>> {
        self.vms.get(name)
    }

    pub fn net(&self, name: &str) -> Option<&Arc<Network>> {
        self.nets.get(name)
    }

    /// Resolve VM names to handles; an empty list means every VM. All
    /// unknown names are reported together.
    fn select_vms(&self, names: &[&str]) -> VirtlabResult<Vec<Arc<Vm>>> {
        if names.is_empty() {
            return Ok(self.vms.values().cloned().collect());
        }
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !self.vms.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(VirtlabError::UnknownEntity { names: missing });
        }
        Ok(names
            .iter()
            .filter_map(|name| self.vms.get(*name).cloned())
            .collect())
    }

    /// Start the given VMs (all of them when `names` is empty), bringing up
    /// the networks they need first. A failure anywhere rolls back what this
    /// call started.
    pub fn start(&self, names: &[&str]) -> VirtlabResult<()> {
        let vms = self.select_vms(names)?;
        let net_names: BTreeSet<String> = if names.is_empty() {
            self.nets.keys().cloned().collect()
        } else {
            vms.iter().flat_map(|vm| vm.nets()).collect()
        };

        info!(vms = vms.len(), nets = net_names.len(), "starting environment");
        with_rollback(|rollback| {
            for name in &net_names {
                let net = self.nets.get(name).ok_or_else(|| VirtlabError::Internal {
                    message: format!("VM references unprovisioned network '{name}'"),
                })?;
                let was_alive = net.alive()?;
                net.start()?;
                if !was_alive {
                    let net = net.clone();
                    rollback.add(move || net.stop());
                }
            }
            for vm in &vms {
                let was_defined = vm.defined()?;
                vm.start()?;
                if !was_defined {
                    let vm = vm.clone();
                    rollback.add(move || vm.stop());
                }
            }
            rollback.clear();
            Ok(())
        })
    }

    /// The networks of `affected` (or all networks when `everything` is set)
    /// minus those some other still-running VM needs.
    fn unused_nets(
        &self,
        affected: &[Arc<Vm>],
        everything: bool,
    ) -> VirtlabResult<BTreeSet<String>> {
        let affected_names: BTreeSet<&str> = affected.iter().map(|vm| vm.name()).collect();
        let mut unused: BTreeSet<String> = if everything {
            self.nets.keys().cloned().collect()
        } else {
            affected.iter().flat_map(|vm| vm.nets()).collect()
        };
        for vm in self.vms.values() {
            if affected_names.contains(vm.name()) {
                continue;
            }
            if vm.alive()? {
                for net in vm.nets() {
                    unused.remove(&net);
                }
            }
        }
        Ok(unused)
    }

    fn stop_nets(&self, names: &BTreeSet<String>) -> VirtlabResult<()> {
        for name in names {
            if let Some(net) = self.nets.get(name) {
                net.stop()?;
            }
        }
        Ok(())
    }

    /// Stop the given VMs (all of them when `names` is empty) and take down
    /// every network no other still-running VM uses.
    pub fn stop(&self, names: &[&str]) -> VirtlabResult<()> {
        let vms = self.select_vms(names)?;
        info!(vms = vms.len(), "stopping environment");

        let unused = self.unused_nets(&vms, names.is_empty())?;
        for vm in &vms {
            vm.stop()?;
        }
        self.stop_nets(&unused)
    }

    /// Wait until every given guest answers over SSH. Freshly provisioned
    /// guests can take a while to come up, so this uses the long deadline
    /// class.
    pub fn wait_for_ssh(&self, names: &[&str]) -> VirtlabResult<()> {
        let vms = self.select_vms(names)?;
        let tasks: Vec<_> = vms
            .iter()
            .map(|vm| {
                let vm = vm.clone();
                move || vm.wait_for_ssh(LONG_TIMEOUT)
            })
            .collect();
        invoke_in_parallel(tasks)?;
        Ok(())
    }

    /// Gracefully power off the given VMs through their guests, in parallel,
    /// then take down every network no other still-running VM uses.
    pub fn shutdown(&self, names: &[&str]) -> VirtlabResult<()> {
        let vms = self.select_vms(names)?;
        let unused = self.unused_nets(&vms, names.is_empty())?;
        let tasks: Vec<_> = vms
            .iter()
            .map(|vm| {
                let vm = vm.clone();
                move || vm.shutdown()
            })
            .collect();
        invoke_in_parallel(tasks)?;
        self.stop_nets(&unused)
    }

    /// Reboot the given VMs through their guests, in parallel.
    pub fn reboot(&self, names: &[&str]) -> VirtlabResult<()> {
        let vms = self.select_vms(names)?;
        let tasks: Vec<_> = vms
            .iter()
            .map(|vm| {
                let vm = vm.clone();
                move || vm.reboot()
            })
            .collect();
        invoke_in_parallel(tasks)?;
        Ok(())
    }

    /// Snapshot every VM under the same name, in parallel.
    pub fn create_snapshots(&self, name: &str) -> VirtlabResult<()> {
        info!(snapshot = name, "snapshotting environment");
        let tasks: Vec<_> = self
            .vms
            .values()
            .map(|vm| {
                let vm = vm.clone();
                let name = name.to_string();
                move || vm.create_snapshot(&name)
            })
            .collect();
        invoke_in_parallel(tasks)?;
        Ok(())
    }

    /// Revert every VM to the named snapshot, in parallel.
    pub fn revert_snapshots(&self, name: &str) -> VirtlabResult<()> {
        info!(snapshot = name, "reverting environment");
        let tasks: Vec<_> = self
            .vms
            .values()
            .map(|vm| {
                let vm = vm.clone();
                let name = name.to_string();
                move || vm.revert_snapshot(&name)
            })
            .collect();
        invoke_in_parallel(tasks)?;
        Ok(())
    }

    /// Snapshot names per VM.
    pub fn get_snapshots(&self) -> BTreeMap<String, Vec<String>> {
        self.vms
            .iter()
            .map(|(name, vm)| (name.clone(), vm.snapshot_names()))
            .collect()
    }

    /// Persist the index and every network and VM spec.
    pub fn save(&self) -> VirtlabResult<()> {
        let index = EnvIndex {
            nets: self.nets.keys().cloned().collect(),
            vms: self.vms.keys().cloned().collect(),
        };
        fs::write(self.paths.env_index(), serde_json::to_vec_pretty(&index)?)?;
        for net in self.nets.values() {
            net.save()?;
        }
        for vm in self.vms.values() {
            vm.save()?;
        }
        Ok(())
    }

    /// Tear the environment down completely: stop everything, release the
    /// leased subnets, and remove the working directory.
    pub fn destroy(self) -> VirtlabResult<()> {
        info!(root = %self.paths.root().display(), "destroying environment");
        self.stop(&[])?;
        for net in self.nets.values() {
            if let Some(gateway) = net.gateway() {
                if let Err(err) = self.leases.release(gateway) {
                    warn!(net = %net.name(), "failed to release subnet lease: {err}");
                }
            }
        }
        fs::remove_dir_all(self.paths.root())?;
        Ok(())
    }
}
