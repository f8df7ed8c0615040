use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Result};

/// 9p mount tag of the per-scenario shared directory.
pub const SHARE_TAG: &str = "testdata";

/// Architecture-specific QEMU configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "x86" | "amd64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            _ => bail!("Unknown architecture: {}", s),
        }
    }

    /// The host architecture, if guests are supported on it.
    pub fn host() -> Option<Self> {
        Self::from_str(std::env::consts::ARCH).ok()
    }

    pub fn label(&self) -> &str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }

    pub fn is_arm64(&self) -> bool {
        matches!(self, Arch::Arm64)
    }

    fn qemu_binary(&self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Arm64 => "qemu-system-aarch64",
        }
    }

    fn console(&self) -> &'static str {
        match self {
            Arch::X86_64 => "ttyS0",
            Arch::Arm64 => "ttyAMA0",
        }
    }
}

/// Configuration for the VM that performs the handoff.
///
/// The initramfs is expected to mount the [`SHARE_TAG`] 9p share at
/// `/testdata` and run `/testdata/run.sh`.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub arch: Arch,
    /// Kernel the guest boots first; it runs the loader.
    pub guest_kernel: PathBuf,
    pub initramfs: PathBuf,
    pub memory_mb: u32,
    pub extra_qemu_args: Vec<String>,
}

impl QemuConfig {
    pub fn new(arch: Arch, guest_kernel: PathBuf, initramfs: PathBuf) -> Self {
        QemuConfig {
            arch,
            guest_kernel,
            initramfs,
            memory_mb: 1024,
            extra_qemu_args: vec![],
        }
    }

    /// Kernel command line for the first guest kernel.
    pub fn append(&self) -> String {
        format!("console={} earlyprintk=serial quiet", self.arch.console())
    }

    /// Full QEMU argument list with `shared_dir` exported to the guest.
    pub fn qemu_args(&self, shared_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.arch.is_arm64() {
            args.extend(["-M", "virt", "-cpu", "cortex-a72"].map(String::from));
        }
        args.extend([
            "-m".to_string(),
            self.memory_mb.to_string(),
            "-smp".to_string(),
            "1".to_string(),
            "-nographic".to_string(),
            "-no-reboot".to_string(),
            "-kernel".to_string(),
            self.guest_kernel.display().to_string(),
            "-initrd".to_string(),
            self.initramfs.display().to_string(),
            "-append".to_string(),
            self.append(),
            "-fsdev".to_string(),
            format!(
                "local,id={},path={},security_model=none",
                SHARE_TAG,
                shared_dir.display()
            ),
            "-device".to_string(),
            format!("virtio-9p-pci,fsdev={},mount_tag={}", SHARE_TAG, SHARE_TAG),
        ]);
        args.extend(self.extra_qemu_args.iter().cloned());
        args
    }

    /// QEMU command with the serial console on stdout.
    pub fn command(&self, shared_dir: &Path) -> Command {
        let mut cmd = Command::new(self.arch.qemu_binary());
        cmd.args(self.qemu_args(shared_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}
