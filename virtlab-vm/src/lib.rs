//! Environment engine for virtlab.
//!
//! Turns a declarative topology (networks, VMs, disks) into a provisioned
//! environment under a working directory, then drives the lifecycle of that
//! environment: start, stop, shutdown, snapshot, revert, destroy. Hypervisor
//! and guest access sit behind traits so the whole engine is testable with
//! mocks.

pub mod disk;
pub mod domain;
pub mod env;
pub mod hypervisor;
pub mod network;
pub mod paths;
pub mod remote;
pub mod topology;
pub mod types;

pub use env::{Backend, Environment};
pub use topology::{Topology, TopologyBuilder};
pub use types::{DiskFormat, DiskSource, DiskSpec, NetworkKind, NetworkSpec, NicSpec, TopologySpec, VmSpec};
