//! Extraction and comparison over captured console transcripts

use handoff_check::extract::{extract_post_boot, extract_snapshot, OBSERVED_MARKER};
use handoff_check::oracle::compare_typed;
use handoff_check::{
    compare, extract_pair, Anchor, BootRecord, Comparison, Description, ExtractError, Markers,
    Stage,
};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Transcript in the shape the loader and the test kernel produce.
const TRANSCRIPT: &str = "\
[    1.204] Run /init as init process
2026/10/16 09:14:02 Welcome to u-root!
DEBUG: {\"status\":\"ok\",\"cmdline\":\"kernel\",\"bootloader\":\"u-root kexec\",\"flags\":3,\"mem_lower\":639,\"mem_upper\":1047424,\"mmap\":[{\"size\":20,\"base_addr\":0,\"length\":654336,\"type\":1},{\"size\":20,\"base_addr\":1048576,\"length\":1072562176,\"type\":1}],\"modules\":[{\"start\":1069056,\"end\":1126400,\"name\":\"/kernel\",\"cmdline\":\"foo=bar\"},{\"start\":1126400,\"end\":2101248,\"name\":\"/bbin/bb\",\"cmdline\":\"\"}]}
[    1.991] kexec_core: Starting new kernel
Starting multiboot kernel
{
  \"status\": \"ok\",
  \"cmdline\": \"kernel\",
  \"bootloader\": \"u-root kexec\",
  \"flags\": 3,
  \"mem_lower\": 639,
  \"mem_upper\": 1047424,
  \"mmap\": [
    {\"size\": 20, \"base_addr\": 0, \"length\": 654336, \"type\": 1},
    {\"size\": 20, \"base_addr\": 1048576, \"length\": 1072562176, \"type\": 1}
  ],
  \"modules\": [
    {\"start\": 1069056, \"end\": 1126400, \"name\": \"/kernel\", \"cmdline\": \"foo=bar\"},
    {\"start\": 1126400, \"end\": 2101248, \"name\": \"/bbin/bb\", \"cmdline\": \"\"}
  ]
}
";

#[test]
fn realistic_transcript_round_trips() {
    let (intended, observed): (BootRecord, BootRecord) =
        extract_pair(TRANSCRIPT.as_bytes(), &Markers::default()).unwrap();

    assert_eq!(compare(&intended, &observed), Comparison::Equal);
    assert_eq!(intended.modules().unwrap().len(), 2);
    assert_eq!(intended.as_value()["mmap"][1]["base_addr"], json!(1048576));
}

#[test]
fn realistic_transcript_decodes_into_typed_description() {
    let (intended, observed): (Description, Description) =
        extract_pair(TRANSCRIPT.as_bytes(), &Markers::default()).unwrap();

    assert_eq!(intended, observed);
    assert_eq!(intended.modules[0].cmdline, "foo=bar");
    assert_eq!(intended.modules[1].name, "/bbin/bb");
    assert_eq!(intended.mem_upper, 1047424);
    assert!(compare_typed(&intended, &observed).unwrap().is_equal());
}

#[test]
fn extraction_is_idempotent() {
    let buf = TRANSCRIPT.as_bytes();
    let first = extract_snapshot::<BootRecord>(buf, "DEBUG:", Anchor::LineStart).unwrap();
    let second = extract_snapshot::<BootRecord>(buf, "DEBUG:", Anchor::LineStart).unwrap();
    assert_eq!(first, second);

    let a: BootRecord =
        extract_post_boot(buf, first.resume_at, OBSERVED_MARKER, Anchor::LineStart).unwrap();
    let b: BootRecord =
        extract_post_boot(buf, first.resume_at, OBSERVED_MARKER, Anchor::LineStart).unwrap();
    assert_eq!(a, b);
}

#[test]
fn observed_marker_before_intended_fragment_does_not_count() {
    let buf = "Starting multiboot kernel\n{\"a\":1}\nDEBUG: {\"a\":1}\n";
    let err = extract_pair::<BootRecord>(buf.as_bytes(), &Markers::default()).unwrap_err();
    assert!(matches!(
        err,
        ExtractError::MarkerNotFound {
            stage: Stage::Observed,
            ..
        }
    ));
}

#[test]
fn marker_at_line_start_without_json_fails_closed() {
    // The first line-anchored occurrence is not followed by JSON; a later,
    // valid fragment must not be picked instead.
    let buf = "DEBUG: loader built without multiboot support\nDEBUG: {\"a\":1}\n";
    let err =
        extract_snapshot::<BootRecord>(buf.as_bytes(), "DEBUG:", Anchor::LineStart).unwrap_err();
    match err {
        ExtractError::FragmentUnparsable { stage, excerpt, .. } => {
            assert_eq!(stage, Stage::Intended);
            assert_eq!(excerpt, "loader built without multiboot support");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn truncated_observed_record_is_unparsable() {
    let buf = "DEBUG: {\"a\":[1,2]}\nStarting multiboot kernel\n{\"a\":[1,\n";
    let err = extract_pair::<BootRecord>(buf.as_bytes(), &Markers::default()).unwrap_err();
    assert_eq!(err.stage(), Stage::Observed);
    assert!(err.to_string().contains("could not be decoded"), "{err}");
}

#[test]
fn custom_markers() {
    let markers = Markers {
        intended: "MULTIBOOT_DEBUG_INFO:".into(),
        observed: "==> kernel up".into(),
        anchor: Anchor::Anywhere,
    };
    let buf = "kexec MULTIBOOT_DEBUG_INFO:{\"x\":true}\n==> kernel up {\"x\":true}";
    let (intended, observed): (BootRecord, BootRecord) =
        extract_pair(buf.as_bytes(), &markers).unwrap();
    assert_eq!(intended, observed);
}

#[test]
fn unterminated_intended_fragment() {
    let err = extract_pair::<BootRecord>(b"DEBUG: {\"a\":1}", &Markers::default()).unwrap_err();
    assert!(matches!(err, ExtractError::FragmentUnterminated { .. }));
}
