//! Scenario driver: one capture-and-compare cycle per kernel variant.
//!
//! A scenario walks
//! `NotStarted -> ArtifactCheck -> Running -> AwaitingEarlyMarker`, ending in
//! `Completed`, `Skipped` or `Errored`.
//! The guest and its shared directory are acquired before `Running` and
//! released when the scenario returns, whatever the outcome.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::console::{ConsoleWatcher, WatchOutcome};
use crate::error::ScenarioError;
use crate::extract::{extract_pair, Markers};
use crate::guest::{GuestExit, GuestRunner, GuestSession, LaunchPlan, SessionGuard};
use crate::oracle::{self, Comparison, Mismatch};
use crate::record::BootRecord;

/// Kernel images exercised by default: uncompressed and gzip-compressed.
pub const DEFAULT_VARIANTS: &[&str] = &["kernel", "kernel.gz"];

/// Runs the handoff with the loader's debug dump enabled and captures stdout.
pub const DEFAULT_GUEST_COMMAND: &str = r#"kexec -l /testdata/kernel -e -d --module="/testdata/kernel foo=bar" --module="/bbin/bb" | tee /testdata/output.json"#;

pub const DEFAULT_OUTPUT_FILE: &str = "output.json";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// The loaded kernel reports success and then closes its JSON object.
pub const DEFAULT_EARLY_MARKERS: &[&str] = &[r#""status": "ok""#, "}"];

/// One target-kernel variant, named after its image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variant {
    pub name: String,
}

impl Variant {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn defaults() -> Vec<Variant> {
        DEFAULT_VARIANTS.iter().copied().map(Variant::new).collect()
    }

    /// File name inside the artifact directory.
    pub fn image_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Everything a scenario needs besides the runner.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Directory holding one kernel image per variant.
    pub artifact_dir: Option<PathBuf>,
    pub markers: Markers,
    /// Console markers that must appear, in order, before the guest exits.
    pub early_markers: Vec<String>,
    /// Bound on the whole guest run, early markers included.
    pub timeout: Duration,
    pub guest_command: String,
    /// Name of the captured output file inside the shared directory.
    pub output_file: String,
    pub poll_interval: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            markers: Markers::default(),
            early_markers: DEFAULT_EARLY_MARKERS.iter().map(|m| m.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
            guest_command: DEFAULT_GUEST_COMMAND.to_string(),
            output_file: DEFAULT_OUTPUT_FILE.to_string(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ScenarioConfig {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: Some(artifact_dir.into()),
            ..Self::default()
        }
    }
}

/// Driver state. `Completed` carries whether the records matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    NotStarted,
    ArtifactCheck,
    Running,
    AwaitingEarlyMarker,
    Completed(Completion),
    Skipped,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Pass,
    Fail,
}

/// Why a variant was not run. None of these count as failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// No artifact directory was configured at all.
    ArtifactDirUnset,
    /// The configured artifact directory does not exist or is not a directory.
    ArtifactDirMissing(PathBuf),
    /// The directory exists but holds no image for this variant.
    ArtifactMissing(PathBuf),
    /// The host architecture has no guest support.
    UnsupportedArch(String),
}

impl SkipReason {
    /// Skips that more likely point at a misconfigured run than at an
    /// intentionally unprovisioned variant.
    pub fn is_suspicious(&self) -> bool {
        matches!(
            self,
            SkipReason::ArtifactDirUnset | SkipReason::ArtifactDirMissing(_)
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ArtifactDirUnset => write!(f, "no kernel artifact directory configured"),
            SkipReason::ArtifactDirMissing(dir) => {
                write!(f, "kernel artifact directory {} does not exist", dir.display())
            }
            SkipReason::ArtifactMissing(path) => {
                write!(f, "kernel image {} is not present", path.display())
            }
            SkipReason::UnsupportedArch(arch) => write!(f, "unsupported architecture {arch}"),
        }
    }
}

/// Outcome of one scenario.
#[derive(Debug)]
pub enum Verdict {
    Skip(SkipReason),
    Pass(BootRecord),
    /// The records decoded but differ.
    Fail {
        mismatch: Box<Mismatch>,
        transcript: String,
    },
    /// The protocol broke down before a comparison was possible.
    Error {
        error: ScenarioError,
        transcript: String,
    },
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Skip(_) => "SKIP",
            Verdict::Pass(_) => "PASS",
            Verdict::Fail { .. } => "FAIL",
            Verdict::Error { .. } => "ERROR",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass(_))
    }

    /// Fail and Error both count against the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Fail { .. } | Verdict::Error { .. })
    }

    /// Raw captured output kept for offline debugging, if any.
    pub fn transcript(&self) -> Option<&str> {
        match self {
            Verdict::Fail { transcript, .. } | Verdict::Error { transcript, .. } => {
                Some(transcript.as_str())
            }
            _ => None,
        }
    }
}

/// Verdict plus the path the driver took to reach it.
#[derive(Debug)]
pub struct ScenarioReport {
    pub variant: Variant,
    pub verdict: Verdict,
    pub states: Vec<ScenarioState>,
    pub duration: Duration,
}

impl ScenarioReport {
    /// Report for a variant skipped before the driver ran.
    pub fn skipped(variant: Variant, reason: SkipReason) -> Self {
        Self {
            variant,
            verdict: Verdict::Skip(reason),
            states: vec![ScenarioState::NotStarted, ScenarioState::Skipped],
            duration: Duration::ZERO,
        }
    }

    pub fn final_state(&self) -> ScenarioState {
        self.states
            .last()
            .copied()
            .unwrap_or(ScenarioState::NotStarted)
    }
}

/// Run one variant to completion.
pub fn run_scenario<R: GuestRunner>(
    runner: &R,
    config: &ScenarioConfig,
    variant: &Variant,
) -> ScenarioReport {
    let start = Instant::now();
    let mut driver = Driver {
        runner,
        config,
        variant,
        states: vec![ScenarioState::NotStarted],
    };

    let verdict = driver.drive();
    let terminal = match &verdict {
        Verdict::Skip(_) => ScenarioState::Skipped,
        Verdict::Pass(_) => ScenarioState::Completed(Completion::Pass),
        Verdict::Fail { .. } => ScenarioState::Completed(Completion::Fail),
        Verdict::Error { .. } => ScenarioState::Errored,
    };
    driver.transition(terminal);

    match &verdict {
        Verdict::Skip(reason) if reason.is_suspicious() => {
            warn!(variant = %variant, "skipped: {}", reason)
        }
        Verdict::Skip(reason) => info!(variant = %variant, "skipped: {}", reason),
        Verdict::Pass(_) => info!(variant = %variant, "boot information preserved across handoff"),
        Verdict::Fail { mismatch, .. } => warn!(variant = %variant, "{}", mismatch),
        Verdict::Error { error, .. } => warn!(variant = %variant, "scenario errored: {}", error),
    }

    ScenarioReport {
        variant: variant.clone(),
        verdict,
        states: driver.states,
        duration: start.elapsed(),
    }
}

/// Run variants one after another.
pub fn run_all<R: GuestRunner>(
    runner: &R,
    config: &ScenarioConfig,
    variants: &[Variant],
) -> Vec<ScenarioReport> {
    variants
        .iter()
        .map(|variant| run_scenario(runner, config, variant))
        .collect()
}

/// Run every variant on its own thread. Reports come back in variant order.
pub fn run_all_parallel<R: GuestRunner + Sync>(
    runner: &R,
    config: &ScenarioConfig,
    variants: &[Variant],
) -> Vec<ScenarioReport> {
    thread::scope(|scope| {
        let handles: Vec<_> = variants
            .iter()
            .map(|variant| scope.spawn(move || run_scenario(runner, config, variant)))
            .collect();

        handles
            .into_iter()
            .zip(variants)
            .map(|(handle, variant)| {
                handle.join().unwrap_or_else(|_| ScenarioReport {
                    variant: variant.clone(),
                    verdict: Verdict::Error {
                        error: ScenarioError::Panicked,
                        transcript: String::new(),
                    },
                    states: vec![ScenarioState::NotStarted, ScenarioState::Errored],
                    duration: Duration::ZERO,
                })
            })
            .collect()
    })
}

enum Lookup {
    Found(PathBuf),
    Skip(SkipReason),
}

struct Driver<'a, R> {
    runner: &'a R,
    config: &'a ScenarioConfig,
    variant: &'a Variant,
    states: Vec<ScenarioState>,
}

impl<R: GuestRunner> Driver<'_, R> {
    fn transition(&mut self, state: ScenarioState) {
        debug!(variant = %self.variant, ?state, "scenario transition");
        self.states.push(state);
    }

    fn drive(&mut self) -> Verdict {
        let (config, variant) = (self.config, self.variant);

        self.transition(ScenarioState::ArtifactCheck);
        let image = match locate_artifact(config, variant) {
            Ok(Lookup::Found(path)) => path,
            Ok(Lookup::Skip(reason)) => return Verdict::Skip(reason),
            Err(error) => return errored(error, b""),
        };

        let shared_dir = match tempfile::Builder::new().prefix("handoff-check-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return errored(ScenarioError::SharedDir(e), b""),
        };

        self.transition(ScenarioState::Running);
        let plan = LaunchPlan {
            variant: &variant.name,
            kernel_image: &image,
            shared_dir: shared_dir.path(),
            command: &config.guest_command,
            timeout: config.timeout,
        };
        let deadline = deadline_after(config.timeout);
        info!(variant = %variant, image = %image.display(), "launching guest");
        let mut guest = match self.runner.launch(&plan) {
            Ok(session) => SessionGuard::new(session),
            Err(e) => return errored(ScenarioError::Launch(e), b""),
        };

        self.transition(ScenarioState::AwaitingEarlyMarker);
        let mut watcher = ConsoleWatcher::new(config.early_markers.iter().cloned())
            .with_poll_interval(config.poll_interval);
        match watcher.watch(&mut guest, deadline) {
            Ok(WatchOutcome::Reached) => {}
            Ok(WatchOutcome::GuestExited { exit, pending }) => {
                return errored(
                    ScenarioError::EarlyMarkerGuestExited {
                        expected: pending,
                        code: exit.code,
                    },
                    watcher.transcript(),
                )
            }
            Ok(WatchOutcome::TimedOut { pending }) => {
                return errored(
                    ScenarioError::EarlyMarkerTimeout {
                        expected: pending,
                        timeout: config.timeout,
                    },
                    watcher.transcript(),
                )
            }
            Err(e) => return errored(ScenarioError::Console(e), watcher.transcript()),
        }

        let exit = match wait_for_exit(&mut guest, &mut watcher, deadline, config.poll_interval) {
            Ok(Some(exit)) => exit,
            Ok(None) => {
                if let Err(e) = guest.kill() {
                    warn!(variant = %variant, "failed to kill timed out guest: {}", e);
                }
                return errored(ScenarioError::GuestTimeout(config.timeout), watcher.transcript());
            }
            Err(e) => return errored(ScenarioError::Console(e), watcher.transcript()),
        };
        if !exit.success() {
            return errored(ScenarioError::GuestExit { code: exit.code }, watcher.transcript());
        }

        let output_path = shared_dir.path().join(&config.output_file);
        let output = match fs::read(&output_path) {
            Ok(output) => output,
            Err(source) => {
                return errored(
                    ScenarioError::CapturedOutput {
                        path: output_path,
                        source,
                    },
                    watcher.transcript(),
                )
            }
        };
        let transcript = String::from_utf8_lossy(&output).into_owned();
        debug!(variant = %variant, "captured output:\n{}", transcript);

        let (intended, observed): (BootRecord, BootRecord) =
            match extract_pair(&output, &config.markers) {
                Ok(pair) => pair,
                Err(e) => {
                    return Verdict::Error {
                        error: e.into(),
                        transcript,
                    }
                }
            };

        match oracle::compare(&intended, &observed) {
            Comparison::Equal => Verdict::Pass(intended),
            Comparison::Mismatch(mismatch) => Verdict::Fail {
                mismatch,
                transcript,
            },
        }
    }
}

fn locate_artifact(config: &ScenarioConfig, variant: &Variant) -> Result<Lookup, ScenarioError> {
    let Some(dir) = config.artifact_dir.as_deref() else {
        return Ok(Lookup::Skip(SkipReason::ArtifactDirUnset));
    };

    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(Lookup::Skip(SkipReason::ArtifactDirMissing(dir.to_path_buf()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Lookup::Skip(SkipReason::ArtifactDirMissing(dir.to_path_buf())))
        }
        Err(source) => {
            return Err(ScenarioError::ArtifactLookup {
                path: dir.to_path_buf(),
                source,
            })
        }
    }

    let path = dir.join(variant.image_name());
    match fs::metadata(&path) {
        Ok(_) => Ok(Lookup::Found(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Ok(Lookup::Skip(SkipReason::ArtifactMissing(path)))
        }
        Err(source) => Err(ScenarioError::ArtifactLookup { path, source }),
    }
}

fn wait_for_exit<S: GuestSession>(
    guest: &mut S,
    watcher: &mut ConsoleWatcher,
    deadline: Instant,
    poll_interval: Duration,
) -> io::Result<Option<GuestExit>> {
    loop {
        watcher.drain(guest)?;
        if let Some(exit) = guest.try_wait()? {
            watcher.finish(guest)?;
            return Ok(Some(exit));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(poll_interval);
    }
}

/// Stand-in wait for timeouts too large to represent as an `Instant`.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(UNBOUNDED_WAIT))
        .unwrap_or(now)
}

fn errored(error: ScenarioError, transcript: &[u8]) -> Verdict {
    Verdict::Error {
        error,
        transcript: String::from_utf8_lossy(transcript).into_owned(),
    }
}
