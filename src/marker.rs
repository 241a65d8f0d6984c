//! Phase Marker Protocol: embedding and recovering phase progress from
//! issue comment bodies.
//!
//! Grounded on the teacher's `util::extract_json_object` (find embedded
//! JSON in free text) generalized to a fixed tag wrapper, using `regex`
//! directly rather than brace-counting since the wire format's delimiter
//! (`<!-- SEQUANT_PHASE: ... -->`) is unambiguous.

use crate::model::{MarkerStatus, Phase, PhaseMarker};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const MARKER_PREFIX: &str = "SEQUANT_PHASE:";

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!--\s*SEQUANT_PHASE:\s*(\{.*?\})\s*-->").expect("valid marker regex")
    })
}

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)(```.*?```|~~~.*?~~~)").expect("valid fence regex"))
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`[^`\n]*`").expect("valid inline code regex"))
}

/// Serialize a marker to its embeddable comment form.
pub fn encode(marker: &PhaseMarker) -> String {
    let json = serde_json::to_string(marker).expect("PhaseMarker always serializes");
    format!("<!-- {MARKER_PREFIX} {json} -->")
}

/// Strip fenced and inline code from a comment body so markers inside code
/// examples are not mistaken for real ones.
fn strip_code(body: &str) -> String {
    let no_fences = fenced_block_re().replace_all(body, "");
    inline_code_re().replace_all(&no_fences, "").into_owned()
}

/// Find every well-formed marker in a single comment body.
pub fn extract_markers(body: &str) -> Vec<PhaseMarker> {
    let stripped = strip_code(body);
    marker_re()
        .captures_iter(&stripped)
        .filter_map(|cap| serde_json::from_str::<PhaseMarker>(&cap[1]).ok())
        .collect()
}

/// Extract markers from every comment and flatten into one list.
pub fn extract_all<'a>(comments: impl IntoIterator<Item = &'a str>) -> Vec<PhaseMarker> {
    comments.into_iter().flat_map(extract_markers).collect()
}

/// For each phase, the marker with the maximum timestamp across all markers.
pub fn phase_map(markers: &[PhaseMarker]) -> BTreeMap<Phase, PhaseMarker> {
    let mut latest: BTreeMap<Phase, PhaseMarker> = BTreeMap::new();
    for marker in markers {
        match latest.get(&marker.phase) {
            // Strict `>` so a tied timestamp is won by the marker
            // encountered later in scan order (spec §8 boundary behavior).
            Some(existing) if existing.timestamp > marker.timestamp => {}
            _ => {
                latest.insert(marker.phase, marker.clone());
            }
        }
    }
    latest
}

/// The single latest marker across all phases, if any exist.
pub fn detect_latest(markers: &[PhaseMarker]) -> Option<PhaseMarker> {
    markers
        .iter()
        .max_by_key(|m| m.timestamp)
        .cloned()
}

/// Drop phases from `requested` whose latest marker says `completed`;
/// phases marked `failed` are kept so they can be retried.
pub fn resumable_phases(requested: &[Phase], markers: &[PhaseMarker]) -> Vec<Phase> {
    let latest = phase_map(markers);
    requested
        .iter()
        .copied()
        .filter(|phase| {
            !matches!(
                latest.get(phase),
                Some(PhaseMarker {
                    status: MarkerStatus::Completed,
                    ..
                })
            )
        })
        .collect()
}
