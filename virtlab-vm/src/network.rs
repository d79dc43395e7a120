//! A provisioned virtual network and its lifecycle.

use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use virtlab_core::error::VirtlabResult;

use crate::hypervisor::Hypervisor;
use crate::types::NetworkSpec;

pub struct Network {
    name: String,
    spec: RwLock<NetworkSpec>,
    hypervisor: Arc<dyn Hypervisor>,
    virt_dir: PathBuf,
}

impl Network {
    pub fn new(spec: NetworkSpec, hypervisor: Arc<dyn Hypervisor>, virt_dir: PathBuf) -> Self {
        Self {
            name: spec.name.clone(),
            spec: RwLock::new(spec),
            hypervisor,
            virt_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.spec.read().gateway
    }

    pub fn is_management(&self) -> bool {
        self.spec.read().management
    }

    /// Look up the address assigned to a NIC identifier on this network.
    pub fn resolve(&self, nic_name: &str) -> Option<Ipv4Addr> {
        self.spec.read().mapping.get(nic_name).copied()
    }

    pub fn alive(&self) -> VirtlabResult<bool> {
        self.hypervisor.network_active(&self.name)
    }

    /// Bring the network up. Starting an already-running network is a no-op.
    pub fn start(&self) -> VirtlabResult<()> {
        if self.alive()? {
            debug!(net = %self.name, "network already active");
            return Ok(());
        }
        info!(net = %self.name, "starting network");
        self.hypervisor.create_network(&self.spec.read())
    }

    pub fn stop(&self) -> VirtlabResult<()> {
        if !self.alive()? {
            return Ok(());
        }
        info!(net = %self.name, "stopping network");
        self.hypervisor.destroy_network(&self.name)
    }

    /// Persist the current spec under the environment's state directory.
    pub fn save(&self) -> VirtlabResult<()> {
        let spec = self.spec.read();
        let path = self.virt_dir.join(format!("net-{}", self.name));
        fs::write(&path, serde_json::to_vec_pretty(&*spec)?)?;
        Ok(())
    }

    pub fn spec(&self) -> NetworkSpec {
        self.spec.read().clone()
    }
}
