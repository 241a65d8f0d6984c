//! Phase prompt templates.
//!
//! Generalizes the teacher's `PhasesFile` (open-ended, numbered phases with
//! one prompt each) to sequant's closed nine-tag `Phase` set: each tag maps
//! to exactly one prompt template with an `{issue}` placeholder.

use crate::model::Phase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTemplates {
    pub templates: BTreeMap<Phase, String>,
}

impl PhaseTemplates {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read phase templates at {:?}: {e}", path))?;
        let templates: BTreeMap<Phase, String> = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid phase templates JSON at {:?}: {e}", path))?;
        Ok(Self { templates })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.templates)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self, phase: Phase) -> Option<&str> {
        self.templates.get(&phase).map(String::as_str)
    }

    /// Render the prompt for `phase` against `issue`, substituting the
    /// `{issue}` placeholder. Falls back to the built-in default template
    /// for phases not overridden in this set.
    pub fn render(&self, phase: Phase, issue: u64) -> String {
        let template = self
            .get(phase)
            .map(str::to_string)
            .unwrap_or_else(|| default_template(phase).to_string());
        template.replace("{issue}", &issue.to_string())
    }
}

impl Default for PhaseTemplates {
    fn default() -> Self {
        let templates = Phase::ALL
            .into_iter()
            .map(|p| (p, default_template(p).to_string()))
            .collect();
        Self { templates }
    }
}

fn default_template(phase: Phase) -> &'static str {
    match phase {
        Phase::Spec => "Investigate issue #{issue} and produce an implementation plan. \
            End with a `## Recommended Workflow` section naming the phases to run.",
        Phase::SecurityReview => {
            "Review the planned change for issue #{issue} for security implications before implementation begins."
        }
        Phase::Testgen => "Generate the test cases that should pass once issue #{issue} is resolved, before writing the fix.",
        Phase::Exec => "Implement the fix for issue #{issue} in this worktree.",
        Phase::Test => "Run and, where needed, extend the test suite covering issue #{issue}.",
        Phase::Verify => "Verify the change for issue #{issue} builds and its tests pass.",
        Phase::Qa => "Assess whether issue #{issue} is resolved to the acceptance criteria. \
            Conclude with `### Verdict: <READY_FOR_MERGE|AC_MET_BUT_NOT_A_PLUS|AC_NOT_MET|NEEDS_VERIFICATION>`.",
        Phase::Loop => "Analyze why the previous attempt at issue #{issue} did not pass QA and adjust the plan.",
        Phase::Merger => "Prepare the final commit and pull request description for issue #{issue}.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_templates_cover_all_phases() {
        let templates = PhaseTemplates::default();
        for p in Phase::ALL {
            assert!(templates.get(p).is_some());
        }
    }

    #[test]
    fn render_substitutes_issue_number() {
        let templates = PhaseTemplates::default();
        let rendered = templates.render(Phase::Exec, 42);
        assert!(rendered.contains("#42"));
        assert!(!rendered.contains("{issue}"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phases.json");
        let templates = PhaseTemplates::default();
        templates.save(&path).unwrap();
        let loaded = PhaseTemplates::load(&path).unwrap();
        assert_eq!(loaded.get(Phase::Qa), templates.get(Phase::Qa));
    }
}
