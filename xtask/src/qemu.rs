//! QEMU-backed guest runner with a live console

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use handoff_check::guest::{GuestExit, GuestRunner, GuestSession, LaunchPlan};
use tracing::{debug, info};

use crate::qemu_config::QemuConfig;

/// Name the kernel image is staged under in the shared directory.
pub const STAGED_KERNEL: &str = "kernel";

/// Script the guest init runs from the shared directory.
pub const GUEST_SCRIPT: &str = "run.sh";

/// Longest wait for more console output once QEMU has exited. Only reached
/// if something else still holds the pipes open.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Boots one QEMU instance per scenario.
pub struct QemuRunner {
    pub config: QemuConfig,
}

impl QemuRunner {
    pub fn new(config: QemuConfig) -> Self {
        Self { config }
    }
}

/// Copy the target kernel and the guest command into the shared directory.
pub fn stage_shared_dir(plan: &LaunchPlan<'_>) -> io::Result<()> {
    fs::copy(plan.kernel_image, plan.shared_dir.join(STAGED_KERNEL))?;
    fs::write(
        plan.shared_dir.join(GUEST_SCRIPT),
        format!("#!/bin/sh\n{}\n", plan.command),
    )?;
    Ok(())
}

impl GuestRunner for QemuRunner {
    type Session = QemuSession;

    fn launch(&self, plan: &LaunchPlan<'_>) -> io::Result<QemuSession> {
        stage_shared_dir(plan)?;

        match describe_shared_dir(plan.shared_dir) {
            Ok(names) => debug!("shared directory {}: {:?}", plan.shared_dir.display(), names),
            Err(e) => debug!("cannot list {}: {}", plan.shared_dir.display(), e),
        }

        let mut cmd = self.config.command(plan.shared_dir);
        info!(
            variant = plan.variant,
            arch = self.config.arch.label(),
            timeout = ?plan.timeout,
            "starting QEMU"
        );
        debug!("QEMU command: {:?}", cmd);
        QemuSession::spawn(&mut cmd)
    }
}

// Reader threads exit when the pipe closes or the session drops its receiver.
fn forward<R: Read + Send + 'static>(mut reader: R, tx: Sender<Vec<u8>>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// A running QEMU process.
pub struct QemuSession {
    child: Child,
    console: Receiver<Vec<u8>>,
}

impl QemuSession {
    /// Spawn `cmd` with its stdout and stderr feeding the console.
    pub fn spawn(cmd: &mut Command) -> io::Result<Self> {
        let mut child = cmd.spawn()?;

        let (tx, console) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward(stderr, tx);
        }

        Ok(QemuSession { child, console })
    }
}

impl GuestSession for QemuSession {
    fn read_console(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.console.try_recv() {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(out)
    }

    // Reader threads may still be forwarding the final pipe contents when
    // the exit is observed; wait for both pipes to close.
    fn finish_console(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.console.recv_timeout(EXIT_DRAIN_GRACE) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(out)
    }

    fn try_wait(&mut self) -> io::Result<Option<GuestExit>> {
        Ok(self.child.try_wait()?.map(GuestExit::from))
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()?;
        Ok(())
    }
}

/// Sorted names of the files staged in `dir`.
pub fn describe_shared_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}
