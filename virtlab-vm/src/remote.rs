//! Guest access over SSH.
//!
//! Shutdown, reboot, and pre-snapshot sync all need a way into the guest.
//! [`RemoteExec`] is that seam; the real implementation shells out to the
//! `ssh` binary through the common [`CommandExecutor`].

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

use virtlab_core::error::{VirtlabError, VirtlabResult};

use crate::disk::{CommandExecutor, CommandStatus};

/// Timeout for operations a healthy guest finishes quickly.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(180);
/// Timeout for operations that may legitimately take long, such as the first
/// boot of a freshly provisioned guest.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(600);

pub trait RemoteExec: Send + Sync {
    /// Run `command` on the guest at `ip`. A non-zero exit status is a
    /// normal result, not an error; errors mean the command could not be
    /// attempted at all.
    fn ssh(&self, ip: Ipv4Addr, command: &[&str]) -> VirtlabResult<CommandStatus>;

    /// Block until the guest accepts SSH connections or `timeout` passes.
    fn wait_for_ssh(&self, ip: Ipv4Addr, timeout: Duration) -> VirtlabResult<()>;
}

/// [`RemoteExec`] backed by the system `ssh` client.
pub struct SshRemote {
    executor: Box<dyn CommandExecutor>,
}

impl SshRemote {
    pub fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn try_ssh(&self, ip: Ipv4Addr, command: &[&str]) -> VirtlabResult<CommandStatus> {
        let target = format!("root@{ip}");
        let mut args = vec![
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=10",
            target.as_str(),
        ];
        args.extend(command);
        self.executor.execute("ssh", &args, None)
    }
}

impl RemoteExec for SshRemote {
    fn ssh(&self, ip: Ipv4Addr, command: &[&str]) -> VirtlabResult<CommandStatus> {
        debug!(%ip, ?command, "running guest command");
        self.try_ssh(ip, command)
    }

    fn wait_for_ssh(&self, ip: Ipv4Addr, timeout: Duration) -> VirtlabResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(status) = self.try_ssh(ip, &["true"]) {
                if status.success() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(VirtlabError::Timeout {
                    operation: format!("waiting for SSH on {ip}"),
                    duration: timeout,
                });
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}
