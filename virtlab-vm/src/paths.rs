//! On-disk layout of an environment working directory.

use std::path::{Path, PathBuf};

/// All paths inside one environment's working directory.
///
/// ```text
/// <root>/
///   uuid            identity file, also what subnet leases point at
///   images/         disk images
///   virt/           persisted state
///     env           index of networks and VMs
///     net-<name>    one file per network spec
///     vm-<name>     one file per VM spec
/// ```
#[derive(Debug, Clone)]
pub struct EnvPaths {
    root: PathBuf,
}

impl EnvPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uuid(&self) -> PathBuf {
        self.root.join("uuid")
    }

    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn virt(&self) -> PathBuf {
        self.root.join("virt")
    }

    pub fn net_spec(&self, name: &str) -> PathBuf {
        self.virt().join(format!("net-{name}"))
    }

    pub fn vm_spec(&self, name: &str) -> PathBuf {
        self.virt().join(format!("vm-{name}"))
    }

    pub fn env_index(&self) -> PathBuf {
        self.virt().join("env")
    }
}
