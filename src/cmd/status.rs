//! `sequant status`: summarize the workflow state store.

use crate::config;
use crate::model::IssueStatus;
use crate::renderer::Renderer;
use crate::state::StateStore;
use anyhow::Result;

pub fn execute(project_dir: std::path::PathBuf, renderer: &dyn Renderer) -> Result<i32> {
    let state_path = config::state_path(&project_dir);
    let store = StateStore::load(&state_path)?;
    let issues = store.get_all_issue_states();

    if issues.is_empty() {
        renderer.line("no tracked issues");
        return Ok(0);
    }

    for state in issues.values() {
        let phase = state
            .current_phase
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());
        renderer.line(&format!(
            "#{:<5} {:<20} {:<10} phase={}",
            state.number,
            truncate(&state.title, 20),
            status_label(state.status),
            phase,
        ));
    }

    let blocked = store.get_issues_by_status(IssueStatus::Blocked).len();
    renderer.finish(&format!("{} issues tracked, {} blocked", issues.len(), blocked));
    Ok(0)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max.saturating_sub(1)).collect::<String>() + "…"
    }
}

fn status_label(status: IssueStatus) -> &'static str {
    match status {
        IssueStatus::NotStarted => "not_started",
        IssueStatus::InProgress => "in_progress",
        IssueStatus::WaitingForQaGate => "waiting_qa_gate",
        IssueStatus::ReadyForMerge => "ready_for_merge",
        IssueStatus::Merged => "merged",
        IssueStatus::Blocked => "blocked",
        IssueStatus::Abandoned => "abandoned",
    }
}
