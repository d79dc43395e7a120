//! Disk image management on top of `qemu-img`.
//!
//! All external process invocation goes through [`CommandExecutor`], so the
//! rest of the engine (and the tests) never touch `std::process` directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use virtlab_core::error::{VirtlabError, VirtlabResult};

use crate::types::{DiskFormat, DiskSource, DiskSpec};

/// Outcome of one external command. A non-zero exit code is not inherently
/// an error; callers decide.
#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub code: i32,
    pub out: String,
    pub err: String,
}

impl CommandStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external commands. Implemented by the real system executor and by
/// test doubles.
pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> VirtlabResult<CommandStatus>;
}

/// Executor backed by `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> VirtlabResult<CommandStatus> {
        debug!(%program, ?args, "executing command");
        let mut command = Command::new(program);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output()?;
        Ok(CommandStatus {
            code: output.status.code().unwrap_or(-1),
            out: String::from_utf8_lossy(&output.stdout).into_owned(),
            err: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Subset of `qemu-img info --output=json` the engine cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "backing-filename")]
    pub backing_filename: Option<PathBuf>,
}

/// Thin wrapper over the `qemu-img` binary.
pub struct QemuImg {
    executor: Box<dyn CommandExecutor>,
}

impl QemuImg {
    pub fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    pub fn system() -> Self {
        Self::new(Box::new(SystemCommandExecutor))
    }

    fn run(&self, args: &[&str], cwd: Option<&Path>) -> VirtlabResult<CommandStatus> {
        let status = self.executor.execute("qemu-img", args, cwd)?;
        if !status.success() {
            return Err(VirtlabError::ExternalTool {
                tool: "qemu-img".into(),
                code: status.code,
                stderr: status.err,
            });
        }
        Ok(status)
    }

    /// Create a copy-on-write layer over `base` at `path`.
    ///
    /// The backing path is passed as given; callers control whether it is
    /// relative by choosing `cwd`.
    pub fn create_backed(
        &self,
        path: &Path,
        base: &str,
        cwd: Option<&Path>,
    ) -> VirtlabResult<()> {
        let path = path.to_string_lossy();
        self.run(
            &[
                "create",
                "-f",
                "qcow2",
                "-o",
                "lazy_refcounts=on",
                "-b",
                base,
                path.as_ref(),
            ],
            cwd,
        )?;
        Ok(())
    }

    /// Create an empty image of `size` (e.g. `"8G"`).
    pub fn create_empty(&self, path: &Path, format: DiskFormat, size: &str) -> VirtlabResult<()> {
        let path = path.to_string_lossy();
        let mut args = vec!["create", "-f", format.as_str()];
        if format == DiskFormat::Qcow2 {
            args.extend(["-o", "preallocation=metadata"]);
        }
        args.push(path.as_ref());
        args.push(size);
        self.run(&args, None)?;
        Ok(())
    }

    /// Merge a layer's delta down into its backing file.
    pub fn commit(&self, path: &Path) -> VirtlabResult<()> {
        let path = path.to_string_lossy();
        self.run(&["commit", path.as_ref()], None)?;
        Ok(())
    }

    pub fn info(&self, path: &Path) -> VirtlabResult<ImageInfo> {
        let path = path.to_string_lossy();
        let status = self.run(&["info", "--output=json", path.as_ref()], None)?;
        Ok(serde_json::from_str(&status.out)?)
    }

    /// Refuse base images that already have a backing file of their own.
    /// The engine only manages chains of depth two (base plus one layer).
    pub fn ensure_shallow_chain(&self, base: &Path) -> VirtlabResult<()> {
        let info = self.info(base)?;
        if let Some(backing) = info.backing_filename {
            return Err(VirtlabError::Unsupported {
                operation: format!(
                    "template '{}' is itself layered over '{}'",
                    base.display(),
                    backing.display()
                ),
            });
        }
        Ok(())
    }
}

/// Materializes the disks of a topology under the environment's image
/// directory and fills in each spec's resolved path.
pub struct DiskBuilder<'a> {
    qemu: &'a QemuImg,
    images_dir: &'a Path,
}

impl<'a> DiskBuilder<'a> {
    pub fn new(qemu: &'a QemuImg, images_dir: &'a Path) -> Self {
        Self { qemu, images_dir }
    }

    pub fn build(&self, vm_name: &str, disk: &mut DiskSpec) -> VirtlabResult<()> {
        let path = match &disk.source {
            DiskSource::Template { base } => {
                self.qemu.ensure_shallow_chain(base)?;
                let path = self.image_path(vm_name, disk);
                self.qemu
                    .create_backed(&path, &base.to_string_lossy(), None)?;
                path
            }
            DiskSource::Empty { size } => {
                let path = self.image_path(vm_name, disk);
                self.qemu.create_empty(&path, disk.format, size)?;
                path
            }
            DiskSource::File { path } => path.clone(),
        };
        info!(vm = vm_name, disk = %disk.name, path = %path.display(), "disk ready");
        disk.path = Some(path);
        Ok(())
    }

    fn image_path(&self, vm_name: &str, disk: &DiskSpec) -> PathBuf {
        self.images_dir
            .join(format!("{vm_name}_{}.{}", disk.name, disk.format.as_str()))
    }
}
