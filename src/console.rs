//! Early-marker watching on the live guest console.
//!
//! Markers are expected in order. Each one is searched for in the accumulated
//! transcript starting just past the previous match, so a marker split across
//! two reads still matches and a later marker never satisfies an earlier one.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use crate::guest::{GuestExit, GuestSession};

/// Outcome of watching the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Every marker was seen, in order.
    Reached,
    /// The guest exited with markers still outstanding.
    GuestExited { exit: GuestExit, pending: String },
    /// The deadline passed with markers still outstanding.
    TimedOut { pending: String },
}

/// Tracks an ordered sequence of console markers.
pub struct ConsoleWatcher {
    markers: Vec<String>,
    next: usize,
    scan_from: usize,
    transcript: Vec<u8>,
    poll_interval: Duration,
}

impl ConsoleWatcher {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|marker: &String| !marker.is_empty())
                .collect(),
            next: 0,
            scan_from: 0,
            transcript: Vec::new(),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Append console bytes and advance past any markers they complete.
    ///
    /// Returns true once every marker has been seen.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        self.transcript.extend_from_slice(bytes);

        while let Some(marker) = self.markers.get(self.next) {
            let needle = marker.as_bytes();
            let found = self.transcript[self.scan_from..]
                .windows(needle.len())
                .position(|window| window == needle);
            match found {
                Some(i) => {
                    tracing::debug!(marker = %marker, "console marker seen");
                    self.scan_from += i + needle.len();
                    self.next += 1;
                }
                None => break,
            }
        }

        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.next >= self.markers.len()
    }

    /// The first marker not yet seen.
    pub fn pending(&self) -> Option<&str> {
        self.markers.get(self.next).map(String::as_str)
    }

    /// Everything the console has produced so far.
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// Poll `session` until every marker is seen, the guest exits, or `deadline` passes.
    ///
    /// The session is left running in every case; the caller decides whether
    /// to keep waiting for it or tear it down.
    pub fn watch<S: GuestSession + ?Sized>(
        &mut self,
        session: &mut S,
        deadline: Instant,
    ) -> io::Result<WatchOutcome> {
        loop {
            let chunk = session.read_console()?;
            if self.feed(&chunk) {
                return Ok(WatchOutcome::Reached);
            }

            if let Some(exit) = session.try_wait()? {
                // Collect whatever the guest printed on its way out.
                let chunk = session.finish_console()?;
                if self.feed(&chunk) {
                    return Ok(WatchOutcome::Reached);
                }
                return Ok(WatchOutcome::GuestExited {
                    exit,
                    pending: self.pending().unwrap_or_default().to_string(),
                });
            }

            if Instant::now() >= deadline {
                return Ok(WatchOutcome::TimedOut {
                    pending: self.pending().unwrap_or_default().to_string(),
                });
            }

            thread::sleep(self.poll_interval);
        }
    }

    /// Pull any pending console output into the transcript without blocking.
    pub fn drain<S: GuestSession + ?Sized>(&mut self, session: &mut S) -> io::Result<()> {
        let chunk = session.read_console()?;
        self.feed(&chunk);
        Ok(())
    }

    /// Pull the rest of the console output of an exited guest.
    pub fn finish<S: GuestSession + ?Sized>(&mut self, session: &mut S) -> io::Result<()> {
        let chunk = session.finish_console()?;
        self.feed(&chunk);
        Ok(())
    }
}
