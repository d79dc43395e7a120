//! Cross-process subnet lease store.
//!
//! Concurrent provisioning runs on one host must not hand out the same
//! management subnet twice. Leases live as JSON files in a shared directory,
//! one file per /24 in the `192.168.200.0/24 ..= 192.168.209.0/24` pool, all
//! mutations serialized by a directory-level lock file. A lease names the
//! environment's uuid file and its expected content; when that file is gone
//! or holds a different uuid, the environment is dead and the lease is
//! reclaimable.

use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{VirtlabError, VirtlabResult};

/// Lowest third octet handed out by the store.
pub const MIN_SUBNET: u8 = 200;
/// Highest third octet handed out by the store.
pub const MAX_SUBNET: u8 = 209;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// On-disk contents of a lease file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    owner_uuid_path: PathBuf,
    owner_uuid_value: String,
}

/// Directory-backed store of subnet leases, shared across processes.
#[derive(Debug, Clone)]
pub struct SubnetLeaseStore {
    lease_dir: PathBuf,
    lock_path: PathBuf,
}

impl SubnetLeaseStore {
    pub fn new(lease_dir: impl Into<PathBuf>) -> Self {
        let lease_dir = lease_dir.into();
        let lock_path = lease_dir.join("leases.lock");
        Self {
            lease_dir,
            lock_path,
        }
    }

    /// Whether `ip` falls inside the pool this store manages.
    pub fn is_leasable(&self, ip: Ipv4Addr) -> bool {
        let octets = ip.octets();
        octets[0] == 192
            && octets[1] == 168
            && (MIN_SUBNET..=MAX_SUBNET).contains(&octets[2])
    }

    /// The /24 network for a pool index.
    pub fn subnet(index: u8) -> Ipv4Net {
        // 192.168.x.0/24 is always a valid prefix length.
        Ipv4Net::new(Ipv4Addr::new(192, 168, index, 0), 24)
            .unwrap_or_else(|_| unreachable!("/24 prefix is valid"))
    }

    /// Acquire the lowest free subnet in the pool for the environment whose
    /// uuid file lives at `owner_uuid_path`, returning its gateway address
    /// (host 1). Stale leases, those whose owner uuid file is missing or has
    /// changed, are reclaimed along the way.
    pub fn acquire(&self, owner_uuid_path: &Path) -> VirtlabResult<Ipv4Addr> {
        fs::create_dir_all(&self.lease_dir)?;
        let _lock = StoreLock::take(&self.lock_path)?;

        for index in MIN_SUBNET..=MAX_SUBNET {
            let lease_path = self.lease_path(index);
            if lease_path.exists() {
                if self.lease_valid(&lease_path) {
                    continue;
                }
                warn!(subnet = index, "reclaiming stale subnet lease");
                fs::remove_file(&lease_path)?;
            }
            self.take_lease(&lease_path, owner_uuid_path)?;
            debug!(subnet = index, "acquired subnet lease");
            return Ok(Ipv4Addr::new(192, 168, index, 1));
        }

        Err(VirtlabError::SubnetPoolExhausted {
            pool: format!(
                "192.168.{MIN_SUBNET}.0/24..=192.168.{MAX_SUBNET}.0/24 at {}",
                self.lease_dir.display()
            ),
        })
    }

    /// Release the lease whose gateway is `gateway`. Releasing an address
    /// that is not leased is not an error.
    pub fn release(&self, gateway: Ipv4Addr) -> VirtlabResult<()> {
        if !self.is_leasable(gateway) {
            return Ok(());
        }
        fs::create_dir_all(&self.lease_dir)?;
        let _lock = StoreLock::take(&self.lock_path)?;
        let lease_path = self.lease_path(gateway.octets()[2]);
        match fs::remove_file(&lease_path) {
            Ok(()) => {
                debug!(subnet = gateway.octets()[2], "released subnet lease");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn lease_path(&self, index: u8) -> PathBuf {
        self.lease_dir.join(format!("{index}.lease"))
    }

    fn take_lease(&self, lease_path: &Path, owner_uuid_path: &Path) -> VirtlabResult<()> {
        let owner_uuid_value = fs::read_to_string(owner_uuid_path)?.trim().to_string();
        let record = LeaseRecord {
            owner_uuid_path: owner_uuid_path.to_path_buf(),
            owner_uuid_value,
        };
        fs::write(lease_path, serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    /// A lease is valid while the uuid file it names still exists with the
    /// recorded content. An unreadable lease file counts as stale.
    fn lease_valid(&self, lease_path: &Path) -> bool {
        let record: LeaseRecord = match fs::read(lease_path)
            .map_err(VirtlabError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(VirtlabError::from))
        {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    lease = %lease_path.display(),
                    "unreadable lease file treated as stale: {err}"
                );
                return false;
            }
        };
        match fs::read_to_string(&record.owner_uuid_path) {
            Ok(current) => current.trim() == record.owner_uuid_value,
            Err(_) => false,
        }
    }
}

/// Exclusive lock over the lease directory, held for the duration of one
/// mutation. Backed by an `O_EXCL` lock file so it works across processes.
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn take(path: &Path) -> VirtlabResult<Self> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(VirtlabError::Timeout {
                            operation: format!("waiting for lease lock {}", path.display()),
                            duration: LOCK_TIMEOUT,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), "failed to remove lease lock: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fan_out;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    fn owner(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, uuid::Uuid::new_v4().simple().to_string()).unwrap();
        path
    }

    #[test]
    fn acquires_lowest_free_subnet_first() {
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        let uuid_path = owner(&dir, "uuid");

        assert_eq!(
            store.acquire(&uuid_path).unwrap(),
            Ipv4Addr::new(192, 168, 200, 1)
        );
        assert_eq!(
            store.acquire(&uuid_path).unwrap(),
            Ipv4Addr::new(192, 168, 201, 1)
        );
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        let uuid_path = owner(&dir, "uuid");

        for _ in MIN_SUBNET..=MAX_SUBNET {
            store.acquire(&uuid_path).unwrap();
        }
        assert!(matches!(
            store.acquire(&uuid_path),
            Err(VirtlabError::SubnetPoolExhausted { .. })
        ));
    }

    #[test]
    fn release_frees_the_subnet() {
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        let uuid_path = owner(&dir, "uuid");

        let first = store.acquire(&uuid_path).unwrap();
        store.acquire(&uuid_path).unwrap();
        store.release(first).unwrap();
        assert_eq!(store.acquire(&uuid_path).unwrap(), first);
    }

    #[test]
    fn releasing_unleased_addresses_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        store.release(Ipv4Addr::new(192, 168, 200, 1)).unwrap();
        store.release(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
    }

    #[test]
    fn stale_lease_is_reclaimed() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        let dead_owner = owner(&dir, "dead-uuid");

        let gateway = store.acquire(&dead_owner).unwrap();
        fs::remove_file(&dead_owner).unwrap();

        let live_owner = owner(&dir, "live-uuid");
        assert_eq!(store.acquire(&live_owner).unwrap(), gateway);
    }

    #[test]
    fn corrupt_lease_file_is_reclaimed() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        let uuid_path = owner(&dir, "uuid");

        store.acquire(&uuid_path).unwrap();
        fs::write(dir.path().join("leases").join("200.lease"), b"not json").unwrap();
        assert_eq!(
            store.acquire(&uuid_path).unwrap(),
            Ipv4Addr::new(192, 168, 200, 1)
        );
    }

    #[test]
    fn leasable_range_bounds() {
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        assert!(store.is_leasable(Ipv4Addr::new(192, 168, 200, 1)));
        assert!(store.is_leasable(Ipv4Addr::new(192, 168, 209, 254)));
        assert!(!store.is_leasable(Ipv4Addr::new(192, 168, 199, 1)));
        assert!(!store.is_leasable(Ipv4Addr::new(192, 168, 210, 1)));
        assert!(!store.is_leasable(Ipv4Addr::new(10, 168, 200, 1)));
    }

    #[test]
    fn concurrent_acquires_get_distinct_subnets() {
        let dir = TempDir::new().unwrap();
        let store = SubnetLeaseStore::new(dir.path().join("leases"));
        let uuid_path = owner(&dir, "uuid");

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let store = store.clone();
                let uuid_path = uuid_path.clone();
                move || store.acquire(&uuid_path)
            })
            .collect();

        let gateways: BTreeSet<Ipv4Addr> = fan_out(tasks)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(gateways.len(), 5);
    }
}
