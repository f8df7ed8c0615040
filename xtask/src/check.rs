//! Offline verification of a captured output file

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use handoff_check::{compare, extract_pair, BootRecord, Comparison, Markers};
use tracing::debug;

/// Extract both records from `path` and compare them.
pub fn check_file(path: &Path, markers: &Markers) -> Result<Comparison> {
    let output = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    debug!(bytes = output.len(), "read {}", path.display());
    check_output(&output, markers).with_context(|| format!("in {}", path.display()))
}

pub fn check_output(output: &[u8], markers: &Markers) -> Result<Comparison> {
    let (intended, observed): (BootRecord, BootRecord) = extract_pair(output, markers)?;
    Ok(compare(&intended, &observed))
}
