//! Phase Mapper: pure functions that decide which phases an issue runs.
//!
//! Grounded on `dag/builder.rs`'s style of small, independently testable
//! pure functions, and on `cmd/run.rs`'s standalone helpers
//! (`resolve_start_phase`, `blocker_note`) for the "pure function + dedicated
//! unit test" idiom.

use crate::model::Phase;
use std::sync::OnceLock;

const UI_LABELS: &[&str] = &["ui", "frontend", "admin", "web", "browser"];
const BUG_LABELS: &[&str] = &["bug", "fix", "hotfix", "patch"];
const DOCS_LABELS: &[&str] = &["docs", "documentation", "readme"];
const COMPLEX_LABELS: &[&str] = &["complex", "refactor", "breaking", "major"];
const SECURITY_LABELS: &[&str] = &["security", "auth", "authentication", "permissions", "admin"];

fn has_any_label(labels: &[String], set: &[&str]) -> bool {
    labels.iter().any(|l| {
        let lower = l.to_ascii_lowercase();
        set.iter().any(|s| lower.contains(s))
    })
}

pub fn is_ui_issue(labels: &[String]) -> bool {
    has_any_label(labels, UI_LABELS)
}

pub fn is_bug_issue(labels: &[String]) -> bool {
    has_any_label(labels, BUG_LABELS)
}

pub fn is_docs_issue(labels: &[String]) -> bool {
    has_any_label(labels, DOCS_LABELS)
}

pub fn is_complex_issue(labels: &[String]) -> bool {
    has_any_label(labels, COMPLEX_LABELS)
}

pub fn is_security_issue(labels: &[String]) -> bool {
    has_any_label(labels, SECURITY_LABELS)
}

/// Apply the label-driven adjustments from spec §4.7 to a base phase plan.
pub fn adjust_for_labels(mut phases: Vec<Phase>, labels: &[String]) -> Vec<Phase> {
    if (is_bug_issue(labels) || is_docs_issue(labels)) && phases.first() == Some(&Phase::Spec) {
        phases.remove(0);
    }
    if is_security_issue(labels) {
        if let Some(spec_idx) = phases.iter().position(|p| *p == Phase::Spec) {
            if !phases.contains(&Phase::SecurityReview) {
                phases.insert(spec_idx + 1, Phase::SecurityReview);
            }
        } else if !phases.contains(&Phase::SecurityReview) {
            phases.insert(0, Phase::SecurityReview);
        }
    }
    if is_ui_issue(labels) {
        if let Some(qa_idx) = phases.iter().position(|p| *p == Phase::Qa) {
            if !phases.contains(&Phase::Test) {
                phases.insert(qa_idx, Phase::Test);
            }
        } else if !phases.contains(&Phase::Test) {
            phases.push(Phase::Test);
        }
    }
    phases
}

fn workflow_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?im)^\*\*Phases:\*\*\s*(.+)$").expect("valid workflow regex")
    })
}

fn quality_loop_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?im)^\*\*Quality Loop:\*\*\s*(enabled|disabled)\s*$")
            .expect("valid quality loop regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendedWorkflow {
    pub phases: Vec<Phase>,
    pub quality_loop: Option<bool>,
}

/// Parse a `## Recommended Workflow` section out of spec-phase output.
/// Accepts `→`, `->`, and `,` as token separators. Requires at least one
/// valid phase token to succeed.
pub fn parse_recommended_workflow(output: &str) -> Option<RecommendedWorkflow> {
    let captures = workflow_re().captures(output)?;
    let line = captures.get(1)?.as_str();
    let tokens: Vec<&str> = line
        .split(|c: char| c == '→' || c == ',')
        .flat_map(|s| s.split("->"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let phases: Vec<Phase> = tokens
        .iter()
        .filter_map(|t| Phase::from_str_loose(t))
        .collect();

    if phases.is_empty() {
        return None;
    }

    let quality_loop = quality_loop_re()
        .captures(output)
        .map(|c| &c[1] == "enabled");

    Some(RecommendedWorkflow {
        phases,
        quality_loop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_label_skips_planning() {
        let phases = adjust_for_labels(
            vec![Phase::Spec, Phase::Exec, Phase::Qa],
            &["bug".to_string()],
        );
        assert_eq!(phases, vec![Phase::Exec, Phase::Qa]);
    }

    #[test]
    fn security_label_inserts_review_after_spec() {
        let phases = adjust_for_labels(
            vec![Phase::Spec, Phase::Exec, Phase::Qa],
            &["security".to_string()],
        );
        assert_eq!(
            phases,
            vec![Phase::Spec, Phase::SecurityReview, Phase::Exec, Phase::Qa]
        );
    }

    #[test]
    fn ui_label_inserts_test_before_qa() {
        let phases = adjust_for_labels(
            vec![Phase::Exec, Phase::Qa],
            &["frontend".to_string()],
        );
        assert_eq!(phases, vec![Phase::Exec, Phase::Test, Phase::Qa]);
    }

    #[test]
    fn parse_recommended_workflow_arrow_separated() {
        let output = "## Recommended Workflow\n**Phases:** spec → exec → qa\n**Quality Loop:** enabled\n";
        let parsed = parse_recommended_workflow(output).unwrap();
        assert_eq!(parsed.phases, vec![Phase::Spec, Phase::Exec, Phase::Qa]);
        assert_eq!(parsed.quality_loop, Some(true));
    }

    #[test]
    fn parse_recommended_workflow_comma_separated_no_loop_line() {
        let output = "**Phases:** exec, qa\n";
        let parsed = parse_recommended_workflow(output).unwrap();
        assert_eq!(parsed.phases, vec![Phase::Exec, Phase::Qa]);
        assert_eq!(parsed.quality_loop, None);
    }

    #[test]
    fn parse_recommended_workflow_fails_with_no_valid_tokens() {
        assert!(parse_recommended_workflow("**Phases:** made-up, nonsense").is_none());
    }

    #[test]
    fn parse_recommended_workflow_fails_without_section() {
        assert!(parse_recommended_workflow("no workflow section here").is_none());
    }
}
