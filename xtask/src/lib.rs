//! handoff-check xtask - QEMU orchestration for the handoff scenarios
//!
//! Provides the QEMU-backed guest runner and the offline check used by the
//! `xtask` binary.

pub mod check;
pub mod qemu;
pub mod qemu_config;

pub use check::*;
pub use qemu::*;
pub use qemu_config::*;
