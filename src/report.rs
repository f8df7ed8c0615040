//! Verdict reporting.
//!
//! Reports are printed as KTAP, or as JSON for tooling. Failures carry both
//! decoded records and an excerpt of the raw captured output.

use serde::Serialize;
use serde_json::Value;

use crate::oracle::Difference;
use crate::scenario::{ScenarioReport, ScenarioState, Verdict};

/// Lines of captured output kept in a failure excerpt.
const EXCERPT_LINES: usize = 40;

/// Serializable view of one scenario report.
#[derive(Debug, Serialize)]
pub struct ReportSummary<'a> {
    pub variant: &'a str,
    pub verdict: &'static str,
    pub states: &'a [ScenarioState],
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `guest`, `protocol` or `harness` for errored scenarios.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_origin: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intended: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<&'a Value>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub differences: &'a [Difference],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_excerpt: Option<String>,
}

impl<'a> ReportSummary<'a> {
    pub fn new(report: &'a ScenarioReport) -> Self {
        let mut summary = ReportSummary {
            variant: &report.variant.name,
            verdict: report.verdict.label(),
            states: &report.states,
            duration_ms: report.duration.as_millis(),
            reason: None,
            error_origin: None,
            intended: None,
            observed: None,
            differences: &[],
            output_excerpt: report.verdict.transcript().map(tail),
        };

        match &report.verdict {
            Verdict::Skip(reason) => summary.reason = Some(reason.to_string()),
            Verdict::Pass(record) => summary.intended = Some(record.as_value()),
            Verdict::Fail { mismatch, .. } => {
                summary.reason = Some("boot information changed across the handoff".to_string());
                summary.intended = Some(&mismatch.intended);
                summary.observed = Some(&mismatch.observed);
                summary.differences = &mismatch.differences;
            }
            Verdict::Error { error, .. } => {
                summary.reason = Some(error.to_string());
                summary.error_origin = Some(error.origin());
            }
        }

        summary
    }
}

/// The last [`EXCERPT_LINES`] lines of `transcript`.
pub fn tail(transcript: &str) -> String {
    let lines: Vec<&str> = transcript.lines().collect();
    let start = lines.len().saturating_sub(EXCERPT_LINES);
    lines[start..].join("\n")
}

/// Render reports as KTAP.
pub fn ktap(reports: &[ScenarioReport]) -> String {
    let mut out = String::from("KTAP version 1\n");
    out.push_str(&format!("1..{}\n", reports.len()));

    for (i, report) in reports.iter().enumerate() {
        let seq = i + 1;
        let name = &report.variant.name;
        match &report.verdict {
            Verdict::Pass(_) => out.push_str(&format!("ok {seq} {name}\n")),
            Verdict::Skip(reason) => out.push_str(&format!("ok {seq} {name} # SKIP {reason}\n")),
            Verdict::Fail { mismatch, transcript } => {
                out.push_str(&format!("not ok {seq} {name} # FAIL\n"));
                for line in mismatch.to_string().lines() {
                    out.push_str(&format!("# {line}\n"));
                }
                push_excerpt(&mut out, transcript);
            }
            Verdict::Error { error, transcript } => {
                let origin = error.origin();
                out.push_str(&format!("not ok {seq} {name} # ERROR ({origin}) {error}\n"));
                push_excerpt(&mut out, transcript);
            }
        }
    }

    let count = |f: fn(&Verdict) -> bool| reports.iter().filter(|r| f(&r.verdict)).count();
    out.push_str(&format!(
        "# {} passed, {} failed, {} errored, {} skipped\n",
        count(Verdict::is_pass),
        count(|v| matches!(v, Verdict::Fail { .. })),
        count(|v| matches!(v, Verdict::Error { .. })),
        count(|v| matches!(v, Verdict::Skip(_))),
    ));
    out
}

fn push_excerpt(out: &mut String, transcript: &str) {
    if transcript.is_empty() {
        return;
    }
    out.push_str("# captured output:\n");
    for line in tail(transcript).lines() {
        out.push_str(&format!("#   {line}\n"));
    }
}

/// Render reports as a JSON array.
pub fn json(reports: &[ScenarioReport]) -> serde_json::Result<String> {
    let summaries: Vec<ReportSummary<'_>> = reports.iter().map(ReportSummary::new).collect();
    serde_json::to_string_pretty(&summaries)
}

/// True if nothing failed or errored. Skips do not count against the run.
pub fn all_passed(reports: &[ScenarioReport]) -> bool {
    !reports.iter().any(|r| r.verdict.is_failure())
}
