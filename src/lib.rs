//! Handoff verification harness
//!
//! Checks that a chain-load ("kexec") into a second kernel hands over the
//! boot-information record it intended to. The loader prints the record it
//! computed after one console marker, the loaded kernel prints the record it
//! actually received after another, and this crate pulls both fragments out
//! of the captured console text and compares them structurally.
//!
//! The VM plumbing lives behind the [`guest::GuestRunner`] trait so the whole
//! capture-and-compare cycle can be driven without QEMU.

pub mod console;
pub mod error;
pub mod extract;
pub mod guest;
pub mod oracle;
pub mod record;
pub mod report;
pub mod scenario;

pub use error::{ExtractError, ScenarioError};
pub use extract::{
    extract_pair, extract_post_boot, extract_snapshot, Anchor, Markers, Snapshot, Stage,
};
pub use oracle::{compare, Comparison, Difference, DifferenceKind, Mismatch};
pub use record::{BootRecord, Description};
pub use scenario::{
    run_all, run_all_parallel, run_scenario, ScenarioConfig, ScenarioReport, ScenarioState,
    SkipReason, Variant, Verdict,
};
