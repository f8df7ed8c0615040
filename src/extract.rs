//! Marker-delimited JSON extraction from captured console output.
//!
//! Two fragments are pulled out of one buffer:
//!
//! - the *intended* record, printed by the loader after [`Markers::intended`]
//!   and terminated by the next newline;
//! - the *observed* record, printed by the loaded kernel after
//!   [`Markers::observed`], which must start after the intended fragment ends
//!   and runs to the end of the buffer.
//!
//! The first accepted marker occurrence is final. If the bytes after it are not
//! a JSON object the extraction fails instead of searching further.

use std::fmt;
use std::ops::Range;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExtractError;

/// Marker preceding the record the loader computed.
pub const INTENDED_MARKER: &str = "DEBUG:";

/// Marker printed once the loaded kernel is running.
pub const OBSERVED_MARKER: &str = "Starting multiboot kernel";

const EXCERPT_LIMIT: usize = 256;

/// Which fragment an extraction concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Printed before the handoff.
    Intended,
    /// Printed by the kernel after the handoff.
    Observed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Intended => write!(f, "intended"),
            Stage::Observed => write!(f, "post-handoff"),
        }
    }
}

/// Where a marker occurrence may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    /// Only at the start of a line.
    #[default]
    LineStart,
    /// Anywhere in the buffer.
    Anywhere,
}

/// The two markers delimiting the fragments, plus how they are anchored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    pub intended: String,
    pub observed: String,
    pub anchor: Anchor,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            intended: INTENDED_MARKER.to_string(),
            observed: OBSERVED_MARKER.to_string(),
            anchor: Anchor::default(),
        }
    }
}

/// A decoded intended record and where scanning resumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<R> {
    pub record: R,
    /// Byte range of the JSON fragment, excluding marker and newline.
    pub fragment: Range<usize>,
    /// Offset just past the terminating newline.
    pub resume_at: usize,
}

/// Find the first occurrence of `marker` in `haystack` that satisfies `anchor`.
///
/// Offset 0 of `haystack` counts as a line start.
pub fn find_marker(haystack: &[u8], marker: &str, anchor: Anchor) -> Option<usize> {
    let needle = marker.as_bytes();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }

    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(i, _)| i)
        .find(|&i| match anchor {
            Anchor::Anywhere => true,
            Anchor::LineStart => i == 0 || haystack[i - 1] == b'\n',
        })
}

/// Extract the intended record: the text between `marker` and the next newline.
pub fn extract_snapshot<R: DeserializeOwned>(
    output: &[u8],
    marker: &str,
    anchor: Anchor,
) -> Result<Snapshot<R>, ExtractError> {
    let stage = Stage::Intended;
    let start = find_marker(output, marker, anchor).ok_or_else(|| ExtractError::MarkerNotFound {
        stage,
        marker: marker.to_string(),
    })? + marker.len();

    let newline = output[start..]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| ExtractError::FragmentUnterminated {
            stage,
            marker: marker.to_string(),
            offset: start,
        })?;
    let end = start + newline;

    let record = decode_fragment(&output[start..end], stage, marker)?;
    Ok(Snapshot {
        record,
        fragment: start..end,
        resume_at: end + 1,
    })
}

/// Extract the observed record: everything after `marker`, searched from `from`.
///
/// `from` is normally [`Snapshot::resume_at`] and is treated as a line start.
pub fn extract_post_boot<R: DeserializeOwned>(
    output: &[u8],
    from: usize,
    marker: &str,
    anchor: Anchor,
) -> Result<R, ExtractError> {
    let stage = Stage::Observed;
    let rest = output.get(from..).unwrap_or_default();
    let start = find_marker(rest, marker, anchor).ok_or_else(|| ExtractError::MarkerNotFound {
        stage,
        marker: marker.to_string(),
    })? + marker.len();

    decode_fragment(&rest[start..], stage, marker)
}

/// Run both extraction stages over one captured buffer.
pub fn extract_pair<R: DeserializeOwned>(
    output: &[u8],
    markers: &Markers,
) -> Result<(R, R), ExtractError> {
    let snapshot = extract_snapshot(output, &markers.intended, markers.anchor)?;
    let observed = extract_post_boot(
        output,
        snapshot.resume_at,
        &markers.observed,
        markers.anchor,
    )?;
    Ok((snapshot.record, observed))
}

fn decode_fragment<R: DeserializeOwned>(
    fragment: &[u8],
    stage: Stage,
    marker: &str,
) -> Result<R, ExtractError> {
    let unparsable = |source| ExtractError::FragmentUnparsable {
        stage,
        marker: marker.to_string(),
        excerpt: excerpt(fragment),
        source,
    };

    let value: Value = serde_json::from_slice(fragment).map_err(unparsable)?;
    if !value.is_object() {
        return Err(unparsable(serde_json::Error::custom(format!(
            "expected a JSON object, found {}",
            kind_name(&value)
        ))));
    }
    serde_json::from_value(value).map_err(unparsable)
}

fn excerpt(fragment: &[u8]) -> String {
    let text = String::from_utf8_lossy(fragment);
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXCERPT_LIMIT {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(EXCERPT_LIMIT).collect();
        format!("{head}...")
    }
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BootRecord, Description};
    use serde_json::json;

    #[test]
    fn find_marker_respects_line_anchor() {
        let buf = b"error: bad DEBUG: value\nDEBUG: {}\n";
        assert_eq!(find_marker(buf, "DEBUG:", Anchor::Anywhere), Some(11));
        assert_eq!(find_marker(buf, "DEBUG:", Anchor::LineStart), Some(24));
        assert_eq!(find_marker(b"DEBUG:", "DEBUG:", Anchor::LineStart), Some(0));
    }

    #[test]
    fn find_marker_edge_cases() {
        assert_eq!(find_marker(b"", "DEBUG:", Anchor::Anywhere), None);
        assert_eq!(find_marker(b"DEBUG", "DEBUG:", Anchor::Anywhere), None);
        assert_eq!(find_marker(b"anything", "", Anchor::Anywhere), None);
    }

    #[test]
    fn snapshot_stops_at_newline() {
        let buf = b"boot\nDEBUG:{\"a\":1}\ntrailing junk";
        let snap: Snapshot<BootRecord> =
            extract_snapshot(buf, "DEBUG:", Anchor::LineStart).unwrap();
        assert_eq!(snap.record, BootRecord::new(json!({"a": 1})));
        assert_eq!(&buf[snap.fragment.clone()], b"{\"a\":1}");
        assert_eq!(&buf[snap.resume_at..], b"trailing junk");
    }

    #[test]
    fn snapshot_tolerates_carriage_return() {
        let buf = b"DEBUG: {\"a\":1}\r\n";
        let snap: Snapshot<BootRecord> =
            extract_snapshot(buf, "DEBUG:", Anchor::LineStart).unwrap();
        assert_eq!(snap.record, BootRecord::new(json!({"a": 1})));
    }

    #[test]
    fn snapshot_missing_marker() {
        let err = extract_snapshot::<BootRecord>(b"nothing here\n", "DEBUG:", Anchor::Anywhere)
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::MarkerNotFound { stage: Stage::Intended, .. }
        ));
    }

    #[test]
    fn snapshot_unterminated() {
        let err = extract_snapshot::<BootRecord>(b"DEBUG: {\"a\":1}", "DEBUG:", Anchor::LineStart)
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::FragmentUnterminated { offset: 6, .. }
        ));
    }

    #[test]
    fn non_object_fragment_fails_closed() {
        let err = extract_snapshot::<BootRecord>(b"DEBUG: 42\n", "DEBUG:", Anchor::LineStart)
            .unwrap_err();
        match err {
            ExtractError::FragmentUnparsable { source, excerpt, .. } => {
                assert!(source.to_string().contains("expected a JSON object"));
                assert_eq!(excerpt, "42");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn typed_schema_mismatch_is_unparsable() {
        let err = extract_snapshot::<Description>(
            b"DEBUG: {\"modules\": \"not a list\"}\n",
            "DEBUG:",
            Anchor::LineStart,
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::FragmentUnparsable { .. }));
    }

    #[test]
    fn post_boot_only_searches_after_resume_point() {
        // The observed marker appears inside the intended line too.
        let buf: &[u8] =
            b"Starting multiboot kernel\nDEBUG: {\"a\":1}\nStarting multiboot kernel\n{\"a\":1}\n";
        let snap: Snapshot<BootRecord> =
            extract_snapshot(buf, "DEBUG:", Anchor::LineStart).unwrap();
        let observed: BootRecord =
            extract_post_boot(buf, snap.resume_at, OBSERVED_MARKER, Anchor::LineStart).unwrap();
        assert_eq!(observed, snap.record);

        let err =
            extract_post_boot::<BootRecord>(buf, buf.len(), OBSERVED_MARKER, Anchor::LineStart)
                .unwrap_err();
        assert_eq!(err.stage(), Stage::Observed);
    }

    #[test]
    fn post_boot_rejects_trailing_output() {
        let buf = b"DEBUG: {}\nStarting multiboot kernel {} reboot: Power down\n";
        let err = extract_pair::<BootRecord>(buf, &Markers::default()).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::FragmentUnparsable { stage: Stage::Observed, .. }
        ));
    }

    #[test]
    fn long_fragments_are_truncated_in_excerpt() {
        let long = "x".repeat(EXCERPT_LIMIT * 2);
        let text = excerpt(long.as_bytes());
        assert_eq!(text.len(), EXCERPT_LIMIT + 3);
        assert!(text.ends_with("..."));
    }
}
