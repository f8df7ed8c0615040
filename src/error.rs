//! Error taxonomy for extraction and scenario runs.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::extract::Stage;

/// Failure to pull a boot-information record out of captured output.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{stage} marker {marker:?} not found in output")]
    MarkerNotFound { stage: Stage, marker: String },

    #[error("{stage} fragment after {marker:?} at byte {offset} has no terminating newline")]
    FragmentUnterminated {
        stage: Stage,
        marker: String,
        offset: usize,
    },

    #[error(
        "{stage} fragment after {marker:?} could not be decoded: {source} (fragment: {excerpt:?})"
    )]
    FragmentUnparsable {
        stage: Stage,
        marker: String,
        excerpt: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ExtractError {
    /// Which of the two fragments the failure belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            ExtractError::MarkerNotFound { stage, .. }
            | ExtractError::FragmentUnterminated { stage, .. }
            | ExtractError::FragmentUnparsable { stage, .. } => *stage,
        }
    }
}

/// Why a scenario ended in the `Errored` state.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to look up kernel image {path}: {source}")]
    ArtifactLookup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create shared directory: {0}")]
    SharedDir(#[source] io::Error),

    #[error("failed to launch guest: {0}")]
    Launch(#[source] io::Error),

    #[error("failed to read guest console: {0}")]
    Console(#[source] io::Error),

    #[error("console marker {expected:?} not seen before the guest exited (exit code {code:?})")]
    EarlyMarkerGuestExited { expected: String, code: Option<i32> },

    #[error("console marker {expected:?} not seen within {timeout:?}")]
    EarlyMarkerTimeout { expected: String, timeout: Duration },

    #[error("guest did not terminate within {0:?}")]
    GuestTimeout(Duration),

    #[error("guest exited with status {code:?}")]
    GuestExit { code: Option<i32> },

    #[error("failed to read captured output {path}: {source}")]
    CapturedOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("scenario thread panicked")]
    Panicked,
}

impl ScenarioError {
    /// True for failures caused by the guest crashing, hanging or exiting badly.
    pub fn is_guest_failure(&self) -> bool {
        matches!(
            self,
            ScenarioError::EarlyMarkerGuestExited { .. }
                | ScenarioError::EarlyMarkerTimeout { .. }
                | ScenarioError::GuestTimeout(_)
                | ScenarioError::GuestExit { .. }
        )
    }

    /// Which side an error is attributed to in reports: the guest, the
    /// marker protocol, or the harness itself.
    pub fn origin(&self) -> &'static str {
        if self.is_guest_failure() {
            "guest"
        } else if matches!(self, ScenarioError::Extract(_)) {
            "protocol"
        } else {
            "harness"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_attributed_to_their_origin() {
        assert!(ScenarioError::GuestTimeout(Duration::from_secs(60)).is_guest_failure());
        assert_eq!(ScenarioError::GuestExit { code: Some(1) }.origin(), "guest");

        let extract = ScenarioError::Extract(ExtractError::MarkerNotFound {
            stage: Stage::Intended,
            marker: "DEBUG:".into(),
        });
        assert!(!extract.is_guest_failure());
        assert_eq!(extract.origin(), "protocol");

        let launch = ScenarioError::Launch(io::Error::new(io::ErrorKind::NotFound, "qemu"));
        assert_eq!(launch.origin(), "harness");
        assert_eq!(ScenarioError::Panicked.origin(), "harness");
    }
}
