//! `sequant cleanup-orphans` / `rotate-logs` / `rebuild-state` / `discover`.
//!
//! Each of these is a thin CLI wrapper around one State Store, Run Log, or
//! Worktree Manager operation — grounded the same way the teacher's
//! `cmd/compact.rs` wraps a single `forge::compaction` call per subcommand.

use crate::config;
use crate::renderer::Renderer;
use crate::runlog::{self, RotationConfig};
use crate::state::StateStore;
use crate::worktree::WorktreeManager;
use anyhow::Result;

pub fn cleanup_orphans(
    project_dir: std::path::PathBuf,
    hours: Option<u64>,
    dry_run: bool,
    renderer: &dyn Renderer,
) -> Result<i32> {
    let state_path = config::state_path(&project_dir);
    let mut store = StateStore::load(&state_path)?;

    let stale = store.cleanup_stale_entries(dry_run);
    for issue in &stale {
        renderer.line(&format!("#{issue}: worktree gone, marked stale"));
    }

    let max_age_days = (hours.unwrap_or(24 * 7) as i64) / 24;
    let old = store.cleanup_old_entries(max_age_days.max(1), dry_run);
    for issue in &old {
        renderer.line(&format!("#{issue}: merged/abandoned past retention, removed"));
    }

    if !dry_run {
        store.save()?;
    }
    renderer.finish(&format!(
        "{} stale, {} aged out{}",
        stale.len(),
        old.len(),
        if dry_run { " (dry run)" } else { "" }
    ));
    Ok(0)
}

pub fn rotate_logs(project_dir: std::path::PathBuf, dry_run: bool, renderer: &dyn Renderer) -> Result<i32> {
    let settings = crate::config::Settings::load(&project_dir);
    let log_dir = config::log_dir(&project_dir, &settings.run);
    let rotation = RotationConfig {
        enabled: settings.run.rotation.enabled,
        max_size_mb: settings.run.rotation.max_size_mb,
        max_files: settings.run.rotation.max_files,
    };
    let report = runlog::rotate(&log_dir, &rotation, dry_run)?;
    renderer.finish(&format!(
        "deleted {} log files ({:.1}MB -> {:.1}MB){}",
        report.deleted.len(),
        report.before.total_mb(),
        report.after.total_mb(),
        if dry_run { " (dry run)" } else { "" }
    ));
    Ok(0)
}

pub fn rebuild_state(project_dir: std::path::PathBuf, renderer: &dyn Renderer) -> Result<i32> {
    let settings = crate::config::Settings::load(&project_dir);
    let log_dir = config::log_dir(&project_dir, &settings.run);
    let logs = runlog::load_all_newest_first(&log_dir)?;
    let rebuilt = StateStore::rebuild_from_logs(&logs);
    let state_path = config::state_path(&project_dir);
    let mut store = StateStore::load(&state_path).unwrap_or_else(|_| StateStore::empty(&state_path));
    let issue_count = rebuilt.issues.len();
    store.replace_workflow_state(rebuilt);
    store.save()?;
    renderer.finish(&format!("rebuilt state for {issue_count} issues from {} run logs", logs.len()));
    Ok(0)
}

pub async fn discover(project_dir: std::path::PathBuf, renderer: &dyn Renderer) -> Result<i32> {
    let state_path = config::state_path(&project_dir);
    let store = StateStore::load(&state_path)?;
    let tracked: std::collections::HashSet<_> = store
        .get_all_issue_states()
        .values()
        .filter_map(|s| s.branch.clone())
        .collect();

    let worktrees = WorktreeManager::discover(&project_dir).await?;
    let entries = worktrees.list_worktrees().await?;
    let mut untracked = 0;
    for (path, branch) in entries {
        if !path.starts_with(worktrees.worktrees_dir()) {
            continue;
        }
        let Some(branch) = branch else { continue };
        if !tracked.contains(&branch) {
            untracked += 1;
            renderer.line(&format!("{} -> {}", path.display(), branch));
        }
    }
    renderer.finish(&format!("{untracked} untracked worktrees"));
    Ok(0)
}
