//! Hypervisor abstraction.
//!
//! The engine only ever talks to a [`Hypervisor`] trait object. The real
//! deployment implements it over the host virtualization daemon; tests use
//! [`MockHypervisor`], which keeps all state in memory and performs snapshot
//! file shuffling on a temp directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use parking_lot::RwLock;

use virtlab_core::error::{VirtlabError, VirtlabResult};

use crate::types::{DiskSpec, NetworkSpec, VmSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Down,
    Paused,
    Running,
}

/// One disk after a live snapshot: the new writable top layer and the layer
/// it is backed by (the frozen state).
#[derive(Debug, Clone)]
pub struct DiskLayer {
    pub path: PathBuf,
    pub backing: PathBuf,
}

pub trait Hypervisor: Send + Sync {
    fn create_network(&self, spec: &NetworkSpec) -> VirtlabResult<()>;
    fn destroy_network(&self, name: &str) -> VirtlabResult<()>;
    fn network_active(&self, name: &str) -> VirtlabResult<bool>;

    fn create_domain(&self, spec: &VmSpec) -> VirtlabResult<()>;
    fn destroy_domain(&self, name: &str) -> VirtlabResult<()>;
    fn domain_defined(&self, name: &str) -> VirtlabResult<bool>;
    fn domain_state(&self, name: &str) -> VirtlabResult<DomainState>;

    /// Freeze the given disks of a running domain without stopping it. Each
    /// disk's current file becomes the frozen layer and the guest moves to a
    /// fresh top layer. Returns the new layering per disk, in input order.
    fn snapshot_domain_disks(
        &self,
        name: &str,
        snapshot: &str,
        disks: &[DiskSpec],
    ) -> VirtlabResult<Vec<DiskLayer>>;
}

#[derive(Default)]
struct MockState {
    networks: BTreeSet<String>,
    domains: BTreeMap<String, DomainState>,
    failing_domains: BTreeSet<String>,
}

/// In-memory hypervisor for tests.
#[derive(Default)]
pub struct MockHypervisor {
    state: RwLock<MockState>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_domain` fail for this domain name.
    pub fn fail_domain_start(&self, name: &str) {
        self.state.write().failing_domains.insert(name.to_string());
    }

    pub fn set_domain_state(&self, name: &str, state: DomainState) {
        self.state.write().domains.insert(name.to_string(), state);
    }

    pub fn active_networks(&self) -> BTreeSet<String> {
        self.state.read().networks.clone()
    }
}

impl Hypervisor for MockHypervisor {
    fn create_network(&self, spec: &NetworkSpec) -> VirtlabResult<()> {
        self.state.write().networks.insert(spec.name.clone());
        Ok(())
    }

    fn destroy_network(&self, name: &str) -> VirtlabResult<()> {
        self.state.write().networks.remove(name);
        Ok(())
    }

    fn network_active(&self, name: &str) -> VirtlabResult<bool> {
        Ok(self.state.read().networks.contains(name))
    }

    fn create_domain(&self, spec: &VmSpec) -> VirtlabResult<()> {
        let mut state = self.state.write();
        if state.failing_domains.contains(&spec.name) {
            return Err(VirtlabError::Hypervisor {
                operation: "create_domain".into(),
                entity: spec.name.clone(),
                details: "injected failure".into(),
            });
        }
        state
            .domains
            .insert(spec.name.clone(), DomainState::Running);
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> VirtlabResult<()> {
        self.state.write().domains.remove(name);
        Ok(())
    }

    fn domain_defined(&self, name: &str) -> VirtlabResult<bool> {
        Ok(self.state.read().domains.contains_key(name))
    }

    fn domain_state(&self, name: &str) -> VirtlabResult<DomainState> {
        Ok(self
            .state
            .read()
            .domains
            .get(name)
            .copied()
            .unwrap_or(DomainState::Down))
    }

    fn snapshot_domain_disks(
        &self,
        name: &str,
        snapshot: &str,
        disks: &[DiskSpec],
    ) -> VirtlabResult<Vec<DiskLayer>> {
        if self.domain_state(name)? != DomainState::Running {
            return Err(VirtlabError::Hypervisor {
                operation: "snapshot_domain_disks".into(),
                entity: name.to_string(),
                details: "domain is not running".into(),
            });
        }
        let mut layers = Vec::with_capacity(disks.len());
        for disk in disks {
            let current = disk.path.clone().ok_or_else(|| VirtlabError::Internal {
                message: format!("disk '{}' has no resolved path", disk.name),
            })?;
            let mut top = current.clone().into_os_string();
            top.push(format!(".{snapshot}"));
            let top = PathBuf::from(top);
            // The frozen layer keeps the old path; the guest writes to the
            // new top from now on.
            std::fs::write(&top, b"")?;
            layers.push(DiskLayer {
                path: top,
                backing: current,
            });
        }
        Ok(layers)
    }
}
