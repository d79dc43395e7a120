//! Topology building: normalize a declarative spec, lease subnets, and
//! assign every NIC an address.
//!
//! Building runs as one rollback-scoped operation. If any phase fails after
//! subnets have been leased, the leases are released before the error
//! reaches the caller, so a failed build never leaks pool capacity.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use virtlab_core::error::{VirtlabError, VirtlabResult};
use virtlab_core::lease::SubnetLeaseStore;
use virtlab_core::rollback::with_rollback;

use crate::types::{NetworkSpec, TopologySpec, VmSpec};

pub const DEFAULT_DNS_DOMAIN: &str = "virtlab.local";

const HOST_MIN: u8 = 2;
const HOST_MAX: u8 = 254;

/// A fully resolved topology: every network has a gateway, every NIC an
/// address, and the subnets leased on the way are recorded so the caller can
/// own their release.
#[derive(Debug, Clone)]
pub struct Topology {
    pub nets: BTreeMap<String, NetworkSpec>,
    pub domains: BTreeMap<String, VmSpec>,
    /// Gateways of subnets leased during the build, in acquisition order.
    pub leased_subnets: Vec<Ipv4Addr>,
}

/// Builds a [`Topology`] out of a [`TopologySpec`].
pub struct TopologyBuilder<'a> {
    leases: &'a SubnetLeaseStore,
    owner_uuid_path: &'a Path,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(leases: &'a SubnetLeaseStore, owner_uuid_path: &'a Path) -> Self {
        Self {
            leases,
            owner_uuid_path,
        }
    }

    pub fn build(&self, spec: TopologySpec) -> VirtlabResult<Topology> {
        let TopologySpec { mut nets, mut domains } = spec;

        normalize(&mut nets, &mut domains)?;
        select_management(&mut nets);
        self.validate(&nets, &domains)?;
        for net in nets.values_mut() {
            if net.management && net.dns_domain_name.is_none() {
                net.dns_domain_name = Some(DEFAULT_DNS_DOMAIN.to_string());
            }
        }

        with_rollback(|rollback| {
            let mut leased_subnets = Vec::new();
            for net in nets.values_mut() {
                if net.is_nat() && net.gateway.is_none() {
                    let gateway = self.leases.acquire(self.owner_uuid_path)?;
                    let store = self.leases.clone();
                    rollback.add(move || store.release(gateway));
                    debug!(net = %net.name, %gateway, "leased subnet for network");
                    net.gateway = Some(gateway);
                    leased_subnets.push(gateway);
                }
            }

            self.register_static_ips(&mut nets, &mut domains)?;
            allocate_dynamic_ips(&mut nets, &mut domains)?;
            aggregate_dns(&mut nets);
            assign_management_nets(&nets, &mut domains);

            rollback.clear();
            info!(
                nets = nets.len(),
                domains = domains.len(),
                "topology resolved"
            );
            Ok(Topology {
                nets,
                domains,
                leased_subnets,
            })
        })
    }

    fn validate(
        &self,
        nets: &BTreeMap<String, NetworkSpec>,
        domains: &BTreeMap<String, VmSpec>,
    ) -> VirtlabResult<()> {
        if nets.is_empty() {
            return Err(VirtlabError::InvalidTopology {
                message: "at least one network is required".into(),
            });
        }

        for net in nets.values() {
            if let Some(gateway) = net.gateway {
                if self.leases.is_leasable(gateway) {
                    return Err(VirtlabError::InvalidTopology {
                        message: format!(
                            "network '{}' pins gateway {gateway} inside the managed subnet pool",
                            net.name
                        ),
                    });
                }
            }
            if nets.len() > 1 && !net.management && net.dns_domain_name.is_some() {
                return Err(VirtlabError::InvalidTopology {
                    message: format!(
                        "network '{}' sets dns_domain_name but is not a management network",
                        net.name
                    ),
                });
            }
        }

        for (vm_name, vm) in domains {
            let mut mgmt_nics = 0;
            for nic in &vm.nics {
                let net = nets.get(&nic.net).ok_or_else(|| {
                    VirtlabError::InvalidTopology {
                        message: format!(
                            "VM '{vm_name}' references undefined network '{}'",
                            nic.net
                        ),
                    }
                })?;
                if net.management {
                    mgmt_nics += 1;
                }
            }
            if mgmt_nics != 1 {
                return Err(VirtlabError::InvalidTopology {
                    message: format!(
                        "VM '{vm_name}' must have exactly one NIC on a management network, has {mgmt_nics}"
                    ),
                });
            }
        }

        // Duplicate static requests are caught here, before any subnet is
        // leased.
        let mut requested: BTreeMap<(String, Ipv4Addr), Vec<String>> = BTreeMap::new();
        for (vm_name, vm) in domains {
            for nic in &vm.nics {
                if let Some(ip) = nic.ip {
                    requested
                        .entry((nic.net.clone(), ip))
                        .or_default()
                        .push(vm_name.clone());
                }
            }
        }
        for ((_, ip), claimants) in requested {
            if claimants.len() > 1 {
                return Err(VirtlabError::DuplicateIp {
                    ip: ip.to_string(),
                    domains: claimants,
                });
            }
        }

        Ok(())
    }

    /// Record every statically requested address in its network's mapping,
    /// rebasing the host part onto the leased subnet where one was assigned.
    fn register_static_ips(
        &self,
        nets: &mut BTreeMap<String, NetworkSpec>,
        domains: &mut BTreeMap<String, VmSpec>,
    ) -> VirtlabResult<()> {
        for (vm_name, vm) in domains.iter_mut() {
            for (idx, nic) in vm.nics.iter_mut().enumerate() {
                let Some(requested) = nic.ip else { continue };
                let net = nets
                    .get_mut(&nic.net)
                    .ok_or_else(|| VirtlabError::Internal {
                        message: format!("network '{}' vanished after validation", nic.net),
                    })?;
                let Some(gateway) = net.gateway else {
                    // Bridge networks carry addresses verbatim and do no
                    // mapping bookkeeping.
                    continue;
                };

                let ip = if self.leases.is_leasable(gateway) {
                    rebase_host(gateway, requested.octets()[3])
                } else {
                    requested
                };
                if !subnet_of(gateway).contains(&ip) {
                    return Err(VirtlabError::InvalidTopology {
                        message: format!(
                            "VM '{vm_name}' requests {requested} outside network '{}' ({})",
                            net.name,
                            subnet_of(gateway)
                        ),
                    });
                }

                let key = mapping_key(vm_name, idx);
                if let Some((taken_by, _)) = net.mapping.iter().find(|(_, v)| **v == ip) {
                    return Err(VirtlabError::DuplicateIp {
                        ip: ip.to_string(),
                        domains: vec![taken_by.clone(), key],
                    });
                }
                net.mapping.insert(key, ip);
                nic.ip = Some(ip);
            }
        }
        Ok(())
    }
}

fn normalize(
    nets: &mut BTreeMap<String, NetworkSpec>,
    domains: &mut BTreeMap<String, VmSpec>,
) -> VirtlabResult<()> {
    for (name, net) in nets.iter_mut() {
        if name.is_empty() {
            return Err(VirtlabError::InvalidTopology {
                message: "network with empty name".into(),
            });
        }
        net.name = name.clone();
        net.mapping.clear();
        net.dns_records.clear();
        net.dns_forward = None;
    }
    for (name, vm) in domains.iter_mut() {
        if name.is_empty() {
            return Err(VirtlabError::InvalidTopology {
                message: "VM with empty name".into(),
            });
        }
        vm.name = name.clone();
        vm.mgmt_net = None;
    }
    Ok(())
}

/// Ensure at least one management network exists. When the user flags none,
/// the lexicographically first network is promoted.
fn select_management(nets: &mut BTreeMap<String, NetworkSpec>) {
    if nets.values().any(|net| net.management) {
        return;
    }
    if let Some(net) = nets.values_mut().next() {
        debug!(net = %net.name, "promoting network to management");
        net.management = true;
    }
}

/// Hand the lowest vacant host in each NAT network to every address-less NIC.
fn allocate_dynamic_ips(
    nets: &mut BTreeMap<String, NetworkSpec>,
    domains: &mut BTreeMap<String, VmSpec>,
) -> VirtlabResult<()> {
    for (vm_name, vm) in domains.iter_mut() {
        for (idx, nic) in vm.nics.iter_mut().enumerate() {
            if nic.ip.is_some() {
                continue;
            }
            let net = nets.get_mut(&nic.net).ok_or_else(|| VirtlabError::Internal {
                message: format!("network '{}' vanished after validation", nic.net),
            })?;
            if !net.is_nat() {
                continue;
            }
            let Some(gateway) = net.gateway else { continue };

            let taken: BTreeSet<Ipv4Addr> = net.mapping.values().copied().collect();
            let ip = (HOST_MIN..=HOST_MAX)
                .map(|host| rebase_host(gateway, host))
                .find(|candidate| !taken.contains(candidate))
                .ok_or_else(|| VirtlabError::InvalidTopology {
                    message: format!("network '{}' has no free addresses left", net.name),
                })?;
            net.mapping.insert(mapping_key(vm_name, idx), ip);
            nic.ip = Some(ip);
        }
    }
    Ok(())
}

/// Publish the union of all address mappings as DNS records on every
/// management network, and point the other networks' resolvers at the
/// primary management gateway.
fn aggregate_dns(nets: &mut BTreeMap<String, NetworkSpec>) {
    let mut records: BTreeMap<String, Ipv4Addr> = BTreeMap::new();
    for net in nets.values() {
        records.extend(net.mapping.iter().map(|(k, v)| (k.clone(), *v)));
    }
    let primary_gateway = nets
        .values()
        .find(|net| net.management)
        .and_then(|net| net.gateway);

    for net in nets.values_mut() {
        if net.management {
            net.dns_records = records.clone();
        } else {
            net.dns_forward = primary_gateway;
        }
    }
}

fn assign_management_nets(
    nets: &BTreeMap<String, NetworkSpec>,
    domains: &mut BTreeMap<String, VmSpec>,
) {
    for vm in domains.values_mut() {
        vm.mgmt_net = vm
            .nics
            .iter()
            .find(|nic| nets.get(&nic.net).is_some_and(|net| net.management))
            .map(|nic| nic.net.clone());
    }
}

/// DNS name and mapping key for a NIC: the bare VM name for its first NIC,
/// `<vm>-eth<n>` for the rest.
fn mapping_key(vm_name: &str, nic_idx: usize) -> String {
    if nic_idx == 0 {
        vm_name.to_string()
    } else {
        format!("{vm_name}-eth{nic_idx}")
    }
}

fn subnet_of(gateway: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::new(gateway, 24)
        .map(|net| net.trunc())
        .unwrap_or_else(|_| unreachable!("/24 prefix is valid"))
}

fn rebase_host(gateway: Ipv4Addr, host: u8) -> Ipv4Addr {
    let o = gateway.octets();
    Ipv4Addr::new(o[0], o[1], o[2], host)
}
