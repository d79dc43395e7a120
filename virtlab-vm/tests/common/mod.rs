#![allow(dead_code)]

//! Shared test doubles: a filesystem-backed fake `qemu-img` and a guest
//! remote that drives the mock hypervisor.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;

use virtlab_core::error::{VirtlabError, VirtlabResult};
use virtlab_vm::disk::{CommandExecutor, CommandStatus, QemuImg};
use virtlab_vm::env::Backend;
use virtlab_vm::hypervisor::{DomainState, MockHypervisor};
use virtlab_vm::remote::RemoteExec;
use virtlab_vm::types::{
    DiskFormat, DiskSource, DiskSpec, NetworkKind, NetworkSpec, NicSpec, TopologySpec, VmSpec,
};

#[derive(Default)]
struct RecorderState {
    calls: Mutex<Vec<Vec<String>>>,
    backing: Mutex<BTreeMap<PathBuf, PathBuf>>,
}

/// A `qemu-img` stand-in that creates real (empty) files for image layers
/// and remembers the backing relationship of every layer it creates.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    state: Arc<RecorderState>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.calls.lock().clone()
    }

    pub fn backing_of(&self, path: &Path) -> Option<PathBuf> {
        self.state.backing.lock().get(path).cloned()
    }

    fn resolve(raw: &str, cwd: Option<&Path>) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            match cwd {
                Some(dir) => dir.join(path),
                None => path.to_path_buf(),
            }
        }
    }

    fn handle_create(&self, args: &[&str], cwd: Option<&Path>) -> VirtlabResult<CommandStatus> {
        let mut base: Option<String> = None;
        let mut positionals: Vec<&str> = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-f" | "-o" => {
                    iter.next();
                }
                "-b" => base = iter.next().map(|s| s.to_string()),
                other => positionals.push(other),
            }
        }
        let path = Self::resolve(
            positionals.first().ok_or_else(|| VirtlabError::Internal {
                message: "create without a path".into(),
            })?,
            cwd,
        );
        fs::write(&path, b"layer")?;
        if let Some(base) = base {
            self.state
                .backing
                .lock()
                .insert(path, Self::resolve(&base, cwd));
        }
        Ok(ok_status(String::new()))
    }

    fn handle_info(&self, args: &[&str], cwd: Option<&Path>) -> VirtlabResult<CommandStatus> {
        let path = Self::resolve(
            args.last().ok_or_else(|| VirtlabError::Internal {
                message: "info without a path".into(),
            })?,
            cwd,
        );
        let out = match self.state.backing.lock().get(&path) {
            Some(backing) => format!(
                r#"{{"format": "qcow2", "backing-filename": "{}"}}"#,
                backing.display()
            ),
            None => r#"{"format": "qcow2"}"#.to_string(),
        };
        Ok(ok_status(out))
    }
}

fn ok_status(out: String) -> CommandStatus {
    CommandStatus {
        code: 0,
        out,
        err: String::new(),
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> VirtlabResult<CommandStatus> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().map(|s| s.to_string()));
        self.state.calls.lock().push(call);

        if program != "qemu-img" {
            return Ok(ok_status(String::new()));
        }
        match args.first().copied() {
            Some("create") => self.handle_create(&args[1..], cwd),
            Some("info") => self.handle_info(&args[1..], cwd),
            _ => Ok(ok_status(String::new())),
        }
    }
}

/// Guest remote wired to the mock hypervisor: `poweroff` actually takes the
/// domain down, and SSH reachability follows the domain state.
pub struct MockRemote {
    hypervisor: Arc<MockHypervisor>,
    guests: Mutex<BTreeMap<Ipv4Addr, String>>,
}

impl MockRemote {
    pub fn new(hypervisor: Arc<MockHypervisor>) -> Self {
        Self {
            hypervisor,
            guests: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn track(&self, ip: Ipv4Addr, vm_name: &str) {
        self.guests.lock().insert(ip, vm_name.to_string());
    }

    fn guest(&self, ip: Ipv4Addr) -> VirtlabResult<String> {
        self.guests
            .lock()
            .get(&ip)
            .cloned()
            .ok_or_else(|| VirtlabError::Internal {
                message: format!("no guest tracked at {ip}"),
            })
    }
}

impl RemoteExec for MockRemote {
    fn ssh(&self, ip: Ipv4Addr, command: &[&str]) -> VirtlabResult<CommandStatus> {
        let name = self.guest(ip)?;
        if command.first().copied() == Some("poweroff") {
            self.hypervisor.set_domain_state(&name, DomainState::Down);
        }
        Ok(ok_status(String::new()))
    }

    fn wait_for_ssh(&self, ip: Ipv4Addr, timeout: Duration) -> VirtlabResult<()> {
        use virtlab_vm::hypervisor::Hypervisor;
        let name = self.guest(ip)?;
        if self.hypervisor.domain_state(&name)? == DomainState::Running {
            Ok(())
        } else {
            Err(VirtlabError::Timeout {
                operation: format!("waiting for SSH on {ip}"),
                duration: timeout,
            })
        }
    }
}

pub struct TestBackend {
    pub backend: Arc<Backend>,
    pub hypervisor: Arc<MockHypervisor>,
    pub remote: Arc<MockRemote>,
    pub executor: RecordingExecutor,
}

/// Route engine logs through the test harness, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn test_backend() -> TestBackend {
    init_tracing();
    let hypervisor = Arc::new(MockHypervisor::new());
    let executor = RecordingExecutor::default();
    let remote = Arc::new(MockRemote::new(hypervisor.clone()));
    let backend = Arc::new(Backend {
        hypervisor: hypervisor.clone(),
        qemu_img: Arc::new(QemuImg::new(Box::new(executor.clone()))),
        remote: remote.clone(),
    });
    TestBackend {
        backend,
        hypervisor,
        remote,
        executor,
    }
}

pub fn nat_net() -> NetworkSpec {
    NetworkSpec {
        name: String::new(),
        kind: NetworkKind::Nat,
        gateway: None,
        management: false,
        dns_domain_name: None,
        mapping: BTreeMap::new(),
        dns_records: BTreeMap::new(),
        dns_forward: None,
    }
}

pub fn plain_vm(nets: &[&str]) -> VmSpec {
    VmSpec {
        name: String::new(),
        nics: nets
            .iter()
            .map(|net| NicSpec {
                net: net.to_string(),
                ip: None,
            })
            .collect(),
        disks: Vec::new(),
        snapshots: BTreeMap::new(),
        metadata: BTreeMap::new(),
        mgmt_net: None,
        memory: 2048,
        vcpus: 2,
    }
}

pub fn template_disk(base: &Path) -> DiskSpec {
    DiskSpec {
        name: "root".into(),
        dev: "vda".into(),
        format: DiskFormat::Qcow2,
        source: DiskSource::Template {
            base: base.to_path_buf(),
        },
        path: None,
    }
}

/// One NAT network `lan` and the given VMs attached to it.
pub fn lan_spec(vm_names: &[&str]) -> TopologySpec {
    let mut spec = TopologySpec::default();
    spec.nets.insert("lan".into(), nat_net());
    for name in vm_names {
        spec.domains.insert(name.to_string(), plain_vm(&["lan"]));
    }
    spec
}
