use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtlabError {
    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    #[error("No free subnet available in pool {pool}")]
    SubnetPoolExhausted { pool: String },

    #[error("IP {ip} was requested by several domains: {}", domains.join(", "))]
    DuplicateIp { ip: String, domains: Vec<String> },

    #[error("The following entities do not exist: {}", names.join(", "))]
    UnknownEntity { names: Vec<String> },

    #[error("No snapshot '{snapshot}' for VM '{vm}'")]
    SnapshotNotFound { vm: String, snapshot: String },

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    #[error("{tool} exited with status {code}: {stderr}")]
    ExternalTool {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("Hypervisor operation '{operation}' failed for '{entity}': {details}")]
    Hypervisor {
        operation: String,
        entity: String,
        details: String,
    },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type VirtlabResult<T> = std::result::Result<T, VirtlabError>;
