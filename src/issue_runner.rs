//! Issue Runner: drives one issue through its full phase plan, including
//! the quality loop and the pre-submission worktree flow.
//!
//! Phase-plan resolution composes `phase_mapper`'s label rules and
//! `## Recommended Workflow` parsing with `marker::resumable_phases` for
//! `--resume`; the iterate-until-gate shape for the quality loop is
//! grounded on `dag/executor.rs`'s wave loop, narrowed here to a single
//! issue's sequential phase chain rather than a DAG of many.

use crate::agent::AgentConfig;
use crate::errors::EngineError;
use crate::host::{HostClient, IssueDetails};
use crate::marker::{self};
use crate::model::{
    IssueResult, MarkerStatus, Phase, PhaseLog, PhaseMarker, PhaseResult, PhaseStatus, PrInfo,
    QaVerdict,
};
use crate::phase::PhaseTemplates;
use crate::phase_executor::PhaseExecutor;
use crate::phase_mapper::{adjust_for_labels, parse_recommended_workflow};
use crate::state::StateStore;
use crate::worktree::WorktreeManager;
use chrono::Utc;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct IssueRunnerConfig {
    pub base_branch: String,
    pub phase_timeout_secs: u64,
    pub quality_loop: bool,
    pub max_iterations: u32,
    pub chain_mode: bool,
    pub qa_gate: bool,
    pub no_smart_tests: bool,
    pub dry_run: bool,
    pub retry_enabled: bool,
    pub no_pr: bool,
    pub no_rebase: bool,
    pub testgen: bool,
    pub auto_detect_phases: bool,
}

fn default_phase_plan() -> Vec<Phase> {
    vec![Phase::Spec, Phase::Exec, Phase::Qa]
}

fn insert_testgen(mut phases: Vec<Phase>) -> Vec<Phase> {
    if phases.contains(&Phase::Testgen) {
        return phases;
    }
    match phases.iter().position(|p| *p == Phase::Spec) {
        Some(idx) => phases.insert(idx + 1, Phase::Testgen),
        None => phases.insert(0, Phase::Testgen),
    }
    phases
}

/// Resolve the phase plan for an issue: explicit `--phases` wins outright;
/// otherwise start from the label-adjusted default and let a parsed
/// `## Recommended Workflow` (from a prior spec-phase run) override it.
pub fn resolve_phases(
    explicit: Option<&[Phase]>,
    labels: &[String],
    spec_output: Option<&str>,
    testgen: bool,
) -> (Vec<Phase>, Option<bool>) {
    let mut quality_loop_override = None;
    let mut phases = match explicit {
        Some(p) => p.to_vec(),
        None => {
            let base = adjust_for_labels(default_phase_plan(), labels);
            if let Some(output) = spec_output {
                if let Some(workflow) = parse_recommended_workflow(output) {
                    quality_loop_override = workflow.quality_loop;
                    workflow.phases
                } else {
                    base
                }
            } else {
                base
            }
        }
    };
    if testgen {
        phases = insert_testgen(phases);
    }
    (phases, quality_loop_override)
}

pub struct IssueRunner<'a> {
    pub executor: &'a PhaseExecutor,
    pub worktrees: &'a WorktreeManager,
    pub host: &'a HostClient,
    pub templates: &'a PhaseTemplates,
}

fn env_for_phase(
    phase: Phase,
    issue: u64,
    worktree: Option<&std::path::Path>,
    config: &IssueRunnerConfig,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("SEQUANT_ISSUE".to_string(), issue.to_string());
    env.insert("SEQUANT_PHASE".to_string(), phase.as_str().to_string());
    env.insert("SEQUANT_ORCHESTRATOR".to_string(), "1".to_string());
    env.insert("SEQUANT_BASE_BRANCH".to_string(), config.base_branch.clone());
    if config.no_smart_tests {
        env.insert("SEQUANT_SMART_TESTS".to_string(), "0".to_string());
    }
    if let Some(wt) = worktree {
        env.insert(
            "SEQUANT_WORKTREE".to_string(),
            wt.to_string_lossy().to_string(),
        );
    }
    env
}

fn to_log_status(result: &PhaseResult, timed_out: bool) -> crate::model::LogPhaseStatus {
    use crate::model::LogPhaseStatus::*;
    if timed_out {
        Timeout
    } else if result.success {
        Success
    } else {
        Failure
    }
}

impl<'a> IssueRunner<'a> {
    /// Run every phase in `phases` for `issue` in order, applying the
    /// quality loop after a failed `qa` when enabled. Best-effort state and
    /// run-log writes happen after every phase; a state-store write error
    /// never aborts execution (§4.1).
    pub async fn run_issue(
        &self,
        issue: &IssueDetails,
        phases: Vec<Phase>,
        phases_explicit: bool,
        quality_loop_enabled: bool,
        config: &IssueRunnerConfig,
        state: &tokio::sync::Mutex<StateStore>,
        run_log: &tokio::sync::Mutex<crate::runlog::RunLogWriter>,
        shutdown: CancellationToken,
        chain_base: Option<&str>,
    ) -> Result<IssueResult, EngineError> {
        let mut quality_loop_enabled = quality_loop_enabled;
        let started = std::time::Instant::now();
        {
            let mut state = state.lock().await;
            state.initialize_issue(issue.number, issue.title.clone());
            state.update_issue_status(issue.number, crate::model::IssueStatus::InProgress);
        }
        run_log
            .lock()
            .await
            .start_issue(issue.number, issue.title.clone(), issue.label_names());

        let phases = adjust_for_labels(phases, &issue.label_names());

        let existing_markers: Vec<PhaseMarker> = marker::extract_all(issue.comment_bodies());
        let resumable = marker::resumable_phases(&phases, &existing_markers);

        let mut worktree_descriptor = None;
        let mut session_id: Option<String> = None;
        let mut phase_results = Vec::new();
        let mut loop_triggered = false;
        let mut iteration = 0u32;
        let mut abort_reason = None;

        let mut plan = resumable;
        let mut i = 0;
        while i < plan.len() {
            if shutdown.is_cancelled() {
                abort_reason = Some("shutdown requested".to_string());
                break;
            }

            let phase = plan[i];

            if phase.isolated() && worktree_descriptor.is_none() {
                match self
                    .worktrees
                    .ensure_worktree(issue.number, &issue.title, &config.base_branch, chain_base)
                    .await
                {
                    Ok(descriptor) => {
                        state.lock().await.update_worktree_info(
                            issue.number,
                            descriptor.path.clone(),
                            descriptor.branch.clone(),
                        );
                        worktree_descriptor = Some(descriptor);
                    }
                    Err(e) => {
                        abort_reason = Some(format!("failed to prepare worktree: {e}"));
                        break;
                    }
                }
            }

            let cwd = if phase.isolated() {
                worktree_descriptor
                    .as_ref()
                    .map(|d| d.path.clone())
                    .unwrap_or_else(|| self.worktrees.repo_root().to_path_buf())
            } else {
                self.worktrees.repo_root().to_path_buf()
            };

            let prompt = self.templates.render(phase, issue.number);
            let env = env_for_phase(
                phase,
                issue.number,
                worktree_descriptor.as_ref().map(|d| d.path.as_path()),
                config,
            );

            state
                .lock()
                .await
                .update_phase_status(issue.number, phase, PhaseStatus::InProgress);

            let phase_token = shutdown.child_token();
            let timeout_token = phase_token.clone();
            let timeout_secs = config.phase_timeout_secs;
            let timeout_guard = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)).await;
                timeout_token.cancel();
            });

            let (mut result, new_session_id) = if config.dry_run {
                (
                    PhaseResult {
                        phase,
                        success: true,
                        duration_seconds: 0.0,
                        error: None,
                        output: Some("dry run: phase skipped".to_string()),
                        verdict: None,
                        session_id: session_id.clone(),
                    },
                    session_id.clone(),
                )
            } else {
                self.executor
                    .execute_with_retry(
                        phase,
                        &prompt,
                        &cwd,
                        &env,
                        session_id.as_deref(),
                        phase_token.clone(),
                        config.retry_enabled,
                    )
                    .await
            };
            timeout_guard.abort();

            session_id = new_session_id.or(session_id);
            {
                let mut state = state.lock().await;
                if let Some(sid) = &session_id {
                    state.update_session_id(issue.number, sid.clone());
                }

                state.update_phase_status(
                    issue.number,
                    phase,
                    if result.success {
                        PhaseStatus::Completed
                    } else {
                        PhaseStatus::Failed
                    },
                );
            }
            let timed_out = phase_token.is_cancelled() && !shutdown.is_cancelled();
            // `agent.rs` cannot tell a timeout from a shutdown apart (both
            // arrive as the same already-cancelled token), so rewrite its
            // generic message here where the two parent tokens are both
            // still in scope to compare.
            if phase_token.is_cancelled() {
                result.error = Some(if timed_out {
                    format!("Timeout after {}s", config.phase_timeout_secs)
                } else {
                    "Shutdown in progress".to_string()
                });
            }

            run_log.lock().await.log_phase(PhaseLog {
                phase,
                issue_number: issue.number,
                start_time: Utc::now() - chrono::Duration::milliseconds(
                    (result.duration_seconds * 1000.0) as i64,
                ),
                end_time: Utc::now(),
                duration_seconds: result.duration_seconds,
                status: to_log_status(&result, timed_out),
                error: result.error.clone(),
                iterations: if phase == Phase::Qa { Some(iteration + 1) } else { None },
                files_modified: None,
                file_diff_stats: None,
                commit_hash: None,
                cache_metrics: None,
                verdict: result.verdict,
            });

            let marker = PhaseMarker {
                phase,
                status: if result.success {
                    MarkerStatus::Completed
                } else {
                    MarkerStatus::Failed
                },
                timestamp: Utc::now(),
                pr: None,
                error: result.error.clone(),
            };
            let _ = self
                .host
                .post_comment(issue.number, &marker::encode(&marker))
                .await;

            let phase_failed = !result.success;
            phase_results.push(result.clone());

            if phase == Phase::Spec && result.success && config.auto_detect_phases && !phases_explicit {
                if let Some(output) = &result.output {
                    let (mut new_rest, ql_override) =
                        crate::phase_mapper::parse_recommended_workflow(output)
                            .map(|w| (w.phases, w.quality_loop))
                            .unwrap_or_else(|| {
                                let base = adjust_for_labels(
                                    vec![Phase::Exec, Phase::Qa],
                                    &issue.label_names(),
                                );
                                (base, None)
                            });
                    if new_rest.first() == Some(&Phase::Spec) {
                        new_rest.remove(0);
                    }
                    if config.testgen && !new_rest.contains(&Phase::Testgen) {
                        new_rest.insert(0, Phase::Testgen);
                    }
                    plan.truncate(i + 1);
                    plan.extend(new_rest);
                    if let Some(v) = ql_override {
                        quality_loop_enabled = v;
                    }
                }
            }

            if phase == Phase::Qa && phase_failed && quality_loop_enabled {
                if iteration < config.max_iterations {
                    iteration += 1;
                    loop_triggered = true;
                    state.lock().await.update_loop_state(
                        issue.number,
                        crate::model::LoopState {
                            enabled: true,
                            iteration,
                            max_iterations: config.max_iterations,
                        },
                    );
                    if !plan.contains(&Phase::Loop) || i + 1 >= plan.len() {
                        plan.insert(i + 1, Phase::Loop);
                        plan.insert(i + 2, Phase::Exec);
                        plan.insert(i + 3, Phase::Qa);
                    }
                    i += 1;
                    continue;
                } else {
                    abort_reason = Some(format!(
                        "quality loop exhausted after {} iterations",
                        config.max_iterations
                    ));
                    break;
                }
            }

            if phase_failed {
                abort_reason = Some(format!("phase {phase} failed"));
                break;
            }

            i += 1;
        }

        let qa_passed = phase_results
            .iter()
            .rev()
            .find(|r| r.phase == Phase::Qa)
            .map(|r| r.success && r.verdict.as_ref().is_some_and(QaVerdict::allows_submission))
            .unwrap_or(false);

        let mut pr_number = None;
        let mut pr_url = None;

        if abort_reason.is_none() && qa_passed {
            if config.qa_gate {
                state
                    .lock()
                    .await
                    .update_issue_status(issue.number, crate::model::IssueStatus::WaitingForQaGate);
            } else if let Some(descriptor) = &worktree_descriptor {
                match self
                    .worktrees
                    .submit(
                        descriptor,
                        &config.base_branch,
                        config.chain_mode,
                        true,
                        config.no_rebase,
                        config.no_pr,
                        &issue.title,
                        &issue.label_names(),
                    )
                    .await
                {
                    Ok((title, warnings)) => {
                        for w in warnings {
                            let _ = self.host.post_comment(issue.number, &format!("warning: {w}")).await;
                        }
                        if let Some(pr_title) = title {
                            let pr = match self
                                .host
                                .create_pr(
                                    &descriptor.path,
                                    &config.base_branch,
                                    &pr_title,
                                    &format!("Resolves #{}", issue.number),
                                )
                                .await
                            {
                                Ok(pr) => Some(pr),
                                Err(crate::errors::HostError::SubprocessFailed { stderr, .. })
                                    if crate::host::is_pr_already_exists_conflict(&stderr) =>
                                {
                                    // PR already exists (re-run after a prior create
                                    // succeeded but the run was interrupted before
                                    // recording it): re-query and treat as success.
                                    self.host
                                        .find_pr_for_branch(&descriptor.branch)
                                        .await
                                        .ok()
                                        .flatten()
                                }
                                Err(_) => None,
                            };
                            if let Some(pr) = pr {
                                pr_number = Some(pr.number);
                                pr_url = Some(pr.url.clone());
                                let mut state = state.lock().await;
                                state.update_pr_info(
                                    issue.number,
                                    PrInfo {
                                        number: pr.number,
                                        url: pr.url,
                                    },
                                );
                                state.update_issue_status(
                                    issue.number,
                                    crate::model::IssueStatus::ReadyForMerge,
                                );
                            }
                        }
                    }
                    Err(e) => {
                        let _ = self
                            .host
                            .post_comment(issue.number, &format!("warning: submission failed: {e}"))
                            .await;
                    }
                }
            }
        } else if abort_reason.is_some() {
            state
                .lock()
                .await
                .update_issue_status(issue.number, crate::model::IssueStatus::Blocked);
        }

        run_log.lock().await.complete_issue();

        Ok(IssueResult {
            issue_number: issue.number,
            success: abort_reason.is_none(),
            phase_results,
            loop_triggered,
            duration_seconds: started.elapsed().as_secs_f64(),
            pr_number,
            pr_url,
            abort_reason,
        })
    }
}

pub fn agent_config_from(command: String, skip_permissions: bool, mcp_enabled: bool) -> AgentConfig {
    AgentConfig {
        command,
        skip_permissions,
        mcp_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Phase;

    #[test]
    fn resolve_phases_uses_explicit_override_verbatim() {
        let explicit = vec![Phase::Exec, Phase::Qa];
        let (phases, _) = resolve_phases(Some(&explicit), &["bug".to_string()], None, false);
        assert_eq!(phases, vec![Phase::Exec, Phase::Qa]);
    }

    #[test]
    fn resolve_phases_falls_back_to_label_adjusted_default() {
        let (phases, _) = resolve_phases(None, &["bug".to_string()], None, false);
        assert_eq!(phases, vec![Phase::Exec, Phase::Qa]);
    }

    #[test]
    fn resolve_phases_prefers_recommended_workflow_when_present() {
        let output = "## Recommended Workflow\n**Phases:** spec -> testgen -> exec -> qa\n**Quality Loop:** enabled\n";
        let (phases, quality_loop) = resolve_phases(None, &[], Some(output), false);
        assert_eq!(
            phases,
            vec![Phase::Spec, Phase::Testgen, Phase::Exec, Phase::Qa]
        );
        assert_eq!(quality_loop, Some(true));
    }

    #[test]
    fn resolve_phases_inserts_testgen_after_spec() {
        let (phases, _) = resolve_phases(None, &[], None, true);
        assert_eq!(phases, vec![Phase::Spec, Phase::Testgen, Phase::Exec, Phase::Qa]);
    }

    #[test]
    fn insert_testgen_prepends_when_no_spec_present() {
        let phases = insert_testgen(vec![Phase::Exec, Phase::Qa]);
        assert_eq!(phases, vec![Phase::Testgen, Phase::Exec, Phase::Qa]);
    }
}
