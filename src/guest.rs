//! Seams to the guest command runner.
//!
//! A [`GuestRunner`] boots a VM that executes one driver command and streams
//! its console. The scenario driver only needs to poll that console, poll for
//! exit and kill the guest, which is what [`GuestSession`] exposes.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

/// How a guest terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuestExit {
    /// Exit code of the VM process, `None` if it was killed by a signal.
    pub code: Option<i32>,
}

impl GuestExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for GuestExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Everything a runner needs to start one scenario's guest.
#[derive(Debug, Clone, Copy)]
pub struct LaunchPlan<'a> {
    /// Variant name, e.g. `kernel.gz`.
    pub variant: &'a str,
    /// Host path of the kernel image to hand off to.
    pub kernel_image: &'a Path,
    /// Per-scenario directory shared with the guest.
    pub shared_dir: &'a Path,
    /// Command executed inside the guest.
    pub command: &'a str,
    pub timeout: Duration,
}

/// Starts guests.
pub trait GuestRunner {
    type Session: GuestSession;

    fn launch(&self, plan: &LaunchPlan<'_>) -> io::Result<Self::Session>;
}

/// A running guest.
pub trait GuestSession {
    /// Console bytes produced since the previous call. Must not block.
    fn read_console(&mut self) -> io::Result<Vec<u8>>;

    /// Everything the console still holds once the guest has exited. May
    /// block until the console is closed.
    fn finish_console(&mut self) -> io::Result<Vec<u8>> {
        self.read_console()
    }

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<GuestExit>>;

    /// Stop the guest and reap it.
    fn kill(&mut self) -> io::Result<()>;
}

/// Owns a session and kills it on drop unless it has already exited.
pub struct SessionGuard<S: GuestSession> {
    session: S,
    exited: bool,
}

impl<S: GuestSession> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            exited: false,
        }
    }
}

impl<S: GuestSession> GuestSession for SessionGuard<S> {
    fn read_console(&mut self) -> io::Result<Vec<u8>> {
        self.session.read_console()
    }

    fn finish_console(&mut self) -> io::Result<Vec<u8>> {
        self.session.finish_console()
    }

    fn try_wait(&mut self) -> io::Result<Option<GuestExit>> {
        let exit = self.session.try_wait()?;
        if exit.is_some() {
            self.exited = true;
        }
        Ok(exit)
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        self.session.kill()
    }
}

impl<S: GuestSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!("failed to tear down guest: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingSession {
        kills: Rc<Cell<u32>>,
        exited: bool,
    }

    impl GuestSession for CountingSession {
        fn read_console(&mut self) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn try_wait(&mut self) -> io::Result<Option<GuestExit>> {
            Ok(self.exited.then_some(GuestExit { code: Some(0) }))
        }

        fn kill(&mut self) -> io::Result<()> {
            self.kills.set(self.kills.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn guard_kills_running_session_once() {
        let kills = Rc::new(Cell::new(0));
        {
            let mut guard = SessionGuard::new(CountingSession {
                kills: kills.clone(),
                exited: false,
            });
            guard.kill().unwrap();
        }
        assert_eq!(kills.get(), 1);
    }

    #[test]
    fn guard_leaves_exited_session_alone() {
        let kills = Rc::new(Cell::new(0));
        {
            let mut guard = SessionGuard::new(CountingSession {
                kills: kills.clone(),
                exited: true,
            });
            assert!(guard.try_wait().unwrap().is_some());
        }
        assert_eq!(kills.get(), 0);
    }

    #[test]
    fn exit_success() {
        assert!(GuestExit { code: Some(0) }.success());
        assert!(!GuestExit { code: Some(1) }.success());
        assert!(!GuestExit { code: None }.success());
    }
}
