//! `sequant run`: resolve settings, reconcile state, and drive the
//! Scheduler over the requested issues.

use crate::config::{self, CliOverrides, Settings};
use crate::errors::EngineError;
use crate::host::HostClient;
use crate::issue_runner::IssueRunnerConfig;
use crate::model::{Iid, IssueStatus};
use crate::phase::PhaseTemplates;
use crate::phase_executor::PhaseExecutor;
use crate::renderer::Renderer;
use crate::runlog::{RotationConfig, RunLogWriter};
use crate::scheduler::{self, Scheduler};
use crate::shutdown::ShutdownManager;
use crate::state::StateStore;
use crate::worktree::WorktreeManager;
use anyhow::{Context, Result, bail};

/// Raw CLI arguments for the `run` subcommand, gathered here rather than in
/// `main.rs` so this module owns its own parsing the way the teacher's
/// `cmd/run.rs` owns `forge run`'s phase-selection parsing.
pub struct RunArgs {
    pub issues: Vec<String>,
    pub phases: Option<String>,
    pub sequential: bool,
    pub force_parallel: bool,
    pub chain: bool,
    pub qa_gate: bool,
    pub base: Option<String>,
    pub dry_run: bool,
    pub timeout: Option<u64>,
    pub quality_loop: bool,
    pub max_iterations: Option<u32>,
    pub testgen: bool,
    pub batch: Vec<String>,
    pub no_smart_tests: bool,
    pub no_mcp: bool,
    pub no_retry: bool,
    pub no_rebase: bool,
    pub no_pr: bool,
    pub resume: bool,
    pub force: bool,
    pub verbose: bool,
}

/// Parse `"12,15-18,21"`-style tokens into a sorted, deduplicated issue list.
pub fn parse_issue_spec(tokens: &[String]) -> Result<Vec<Iid>> {
    let mut out = std::collections::BTreeSet::new();
    for token in tokens.iter().flat_map(|t| t.split(',')) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = token.split_once('-') {
            let lo: Iid = lo.trim().parse().with_context(|| format!("invalid issue range `{token}`"))?;
            let hi: Iid = hi.trim().parse().with_context(|| format!("invalid issue range `{token}`"))?;
            if lo > hi {
                bail!("invalid issue range `{token}`: start is after end");
            }
            out.extend(lo..=hi);
        } else {
            out.insert(token.parse().with_context(|| format!("invalid issue number `{token}`"))?);
        }
    }
    Ok(out.into_iter().collect())
}

/// Parse repeated `--batch "12,13"` groups into the Scheduler's batch shape.
pub fn parse_batches(raw: &[String]) -> Result<Vec<Vec<Iid>>> {
    raw.iter()
        .map(|group| parse_issue_spec(std::slice::from_ref(group)))
        .collect()
}

pub async fn execute(project_dir: std::path::PathBuf, args: RunArgs, renderer: &dyn Renderer) -> Result<i32> {
    let settings = Settings::load(&project_dir);
    let cli = CliOverrides {
        phases: args.phases.as_deref().map(config::parse_phase_list).transpose()?,
        phase_timeout: args.timeout,
        sequential: args.sequential,
        force_parallel: args.force_parallel,
        chain: args.chain,
        qa_gate: args.qa_gate,
        base_branch: args.base.clone(),
        dry_run: args.dry_run,
        verbose: args.verbose,
        quality_loop: args.quality_loop,
        max_iterations: args.max_iterations,
        testgen: args.testgen,
        no_smart_tests: args.no_smart_tests,
        no_mcp: args.no_mcp,
        no_retry: args.no_retry,
        no_rebase: args.no_rebase,
        no_pr: args.no_pr,
        resume: args.resume,
        force: args.force,
    };
    let exec_config = config::resolve(&project_dir, &cli, &settings).map_err(anyhow::Error::from)?;

    let batches = if args.batch.is_empty() {
        None
    } else {
        Some(parse_batches(&args.batch)?)
    };
    let mode = scheduler::resolve_mode(exec_config.chain, exec_config.sequential, batches);

    let state_path = config::state_path(&project_dir);
    let mut state_store = StateStore::load(&state_path)?;

    let issues: Vec<Iid> = if !args.issues.is_empty() {
        parse_issue_spec(&args.issues)?
    } else if exec_config.resume {
        state_store
            .get_all_issue_states()
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    IssueStatus::InProgress | IssueStatus::Blocked | IssueStatus::WaitingForQaGate
                )
            })
            .map(|s| s.number)
            .collect()
    } else {
        bail!("no issues specified; pass issue numbers/ranges or --resume");
    };
    if issues.is_empty() {
        renderer.line("nothing to run");
        return Ok(0);
    }

    let log_dir = config::log_dir(&project_dir, &settings.run);
    let rotation = RotationConfig {
        enabled: settings.run.rotation.enabled,
        max_size_mb: settings.run.rotation.max_size_mb,
        max_files: settings.run.rotation.max_files,
    };
    let run_log_writer = RunLogWriter::initialize(
        log_dir,
        config::user_log_mirror_dir(),
        rotation,
        crate::model::RunLogConfig {
            phases: exec_config.phases.clone(),
            sequential: exec_config.sequential,
            quality_loop: exec_config.quality_loop,
            max_iterations: exec_config.max_iterations,
            base_branch: exec_config.base_branch.clone(),
            dry_run: exec_config.dry_run,
        },
    );

    let templates_path = config::sequant_dir(&project_dir).join("phase_templates.json");
    let templates = PhaseTemplates::load(&templates_path).unwrap_or_default();

    let host = HostClient::new(project_dir.clone());
    let worktrees = WorktreeManager::discover(&project_dir).await?;
    let executor = PhaseExecutor::new(crate::issue_runner::agent_config_from(
        "claude".to_string(),
        true,
        exec_config.mcp,
    ));

    let state_mutex = tokio::sync::Mutex::new(state_store);
    let run_log_mutex = std::sync::Arc::new(tokio::sync::Mutex::new(run_log_writer));

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers(run_log_mutex.clone());

    let runner_config = IssueRunnerConfig {
        base_branch: exec_config.base_branch.clone(),
        phase_timeout_secs: exec_config.phase_timeout,
        quality_loop: exec_config.quality_loop,
        max_iterations: exec_config.max_iterations,
        chain_mode: exec_config.chain,
        qa_gate: exec_config.qa_gate,
        no_smart_tests: exec_config.no_smart_tests,
        dry_run: exec_config.dry_run,
        retry_enabled: exec_config.retry,
        no_pr: exec_config.no_pr,
        no_rebase: exec_config.no_rebase,
        testgen: exec_config.testgen,
        auto_detect_phases: exec_config.auto_detect_phases,
    };

    let scheduler = Scheduler {
        executor: &executor,
        worktrees: &worktrees,
        host: &host,
        templates: &templates,
        state: &state_mutex,
        run_log: &run_log_mutex,
        shutdown: shutdown.child_token(),
    };

    scheduler.reconcile_at_startup(&exec_config.base_branch).await;

    let results = scheduler
        .run(
            issues,
            mode,
            runner_config,
            exec_config.force_parallel,
            exec_config.phases.clone(),
            exec_config.phases_explicit,
            exec_config.quality_loop,
        )
        .await;

    state_store = state_mutex.into_inner();
    state_store.save()?;

    let (summary, path) = run_log_mutex.lock().await.finalize()?;
    renderer.finish(&format!(
        "run log written to {}: {}/{} issues passed",
        path.display(),
        summary.passed,
        summary.total_issues
    ));

    match results {
        Ok(results) => {
            for result in &results {
                if result.success {
                    renderer.succeed(result.issue_number, "run", result.duration_seconds);
                } else {
                    renderer.fail(
                        result.issue_number,
                        "run",
                        result.abort_reason.as_deref().unwrap_or("unknown failure"),
                    );
                }
            }
            Ok(if scheduler::all_succeeded(&results) { 0 } else { 1 })
        }
        Err(EngineError::DependencyCycle { issues }) => {
            renderer.line(&format!(
                "refusing to run in parallel: dependency edges among {issues:?}; pass --sequential or --force-parallel"
            ));
            Ok(2)
        }
        Err(e) => {
            renderer.line(&format!("run failed: {e}"));
            Ok(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_issue_spec_expands_ranges_and_dedupes() {
        let tokens = vec!["12,15-18".to_string(), "16".to_string()];
        assert_eq!(parse_issue_spec(&tokens).unwrap(), vec![12, 15, 16, 17, 18]);
    }

    #[test]
    fn parse_issue_spec_rejects_backwards_range() {
        let tokens = vec!["18-15".to_string()];
        assert!(parse_issue_spec(&tokens).is_err());
    }

    #[test]
    fn parse_batches_splits_each_group_independently() {
        let raw = vec!["1,2".to_string(), "3-4".to_string()];
        assert_eq!(parse_batches(&raw).unwrap(), vec![vec![1, 2], vec![3, 4]]);
    }
}
