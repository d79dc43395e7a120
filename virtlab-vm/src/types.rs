//! Declarative topology types: networks, NICs, disks, and VM definitions.
//!
//! These are the serde-facing structures. Users write them (minus the fields
//! the builder fills in), the topology builder normalizes and enriches them,
//! and the environment persists them back to disk as its source of truth.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a network reaches the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// Host-managed NAT network with an engine-assigned or explicit subnet.
    #[default]
    Nat,
    /// Attachment to an existing host bridge. No address management.
    Bridge,
}

/// One virtual network in a topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: NetworkKind,
    /// Gateway address; for NAT networks without one, a subnet is leased and
    /// the gateway becomes host 1 of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    /// Whether this is a management network. At most the builder promotes one
    /// network when nothing is flagged explicitly.
    #[serde(default)]
    pub management: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    /// NIC identifier to assigned address, filled by the builder.
    #[serde(default)]
    pub mapping: BTreeMap<String, Ipv4Addr>,
    /// DNS records served on this network, filled by the builder.
    #[serde(default)]
    pub dns_records: BTreeMap<String, Ipv4Addr>,
    /// Upstream resolver for non-management networks, filled by the builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_forward: Option<Ipv4Addr>,
}

impl NetworkSpec {
    pub fn is_nat(&self) -> bool {
        self.kind == NetworkKind::Nat
    }
}

/// A VM network interface. Addresses are either statically requested (last
/// octet meaningful when the network's subnet is engine-assigned) or left for
/// the builder to allocate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub net: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
}

impl NicSpec {
    /// MAC derived from the assigned address, `54:52` followed by the four
    /// address octets. Stable across restarts by construction.
    pub fn mac(&self) -> Option<String> {
        self.ip.map(mac_for_ip)
    }
}

pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("54:52:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Iso,
}

impl DiskFormat {
    /// Only copy-on-write disks take part in snapshots; attached media do
    /// not.
    pub fn snapshot_eligible(self) -> bool {
        matches!(self, DiskFormat::Qcow2 | DiskFormat::Raw)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Iso => "iso",
        }
    }
}

/// Where a disk's content comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiskSource {
    /// Thin copy-on-write layer over a read-only base image.
    Template { base: PathBuf },
    /// Freshly created empty image, size such as `"8G"`.
    Empty { size: String },
    /// Pre-existing file used in place, e.g. an installation ISO.
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    /// Guest device name, e.g. `vda`.
    pub dev: String,
    pub format: DiskFormat,
    pub source: DiskSource,
    /// Resolved path inside the environment, filled during provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// One disk layer frozen by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDisk {
    pub path: PathBuf,
    pub format: DiskFormat,
}

/// One virtual machine in a topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    /// Snapshot name to the disk layers it froze.
    #[serde(default)]
    pub snapshots: BTreeMap<String, Vec<SnapshotDisk>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Name of the management network this VM is reached over, filled by the
    /// builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt_net: Option<String>,
    #[serde(default = "default_memory_mib")]
    pub memory: u32,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
}

fn default_memory_mib() -> u32 {
    2048
}

fn default_vcpus() -> u32 {
    2
}

impl VmSpec {
    /// Address of the NIC on the management network, once assigned.
    pub fn mgmt_ip(&self) -> Option<Ipv4Addr> {
        let mgmt_net = self.mgmt_net.as_deref()?;
        self.nics
            .iter()
            .find(|nic| nic.net == mgmt_net)
            .and_then(|nic| nic.ip)
    }
}

/// The user-facing environment definition: named networks and named VMs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub nets: BTreeMap<String, NetworkSpec>,
    #[serde(default)]
    pub domains: BTreeMap<String, VmSpec>,
}
