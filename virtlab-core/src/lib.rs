//! Shared primitives for the virtlab fleet-orchestration engine.
//!
//! This crate holds the pieces the provisioning engine is built on and that
//! carry no hypervisor knowledge of their own: the error taxonomy, the
//! rollback ledger used to make multi-phase operations atomic with respect to
//! failure, the thread-based fan-out executor, and the cross-process subnet
//! lease store.

pub mod error;
pub mod executor;
pub mod lease;
pub mod rollback;

pub use error::{VirtlabError, VirtlabResult};
