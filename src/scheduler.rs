//! Scheduler: drives parallel / sequential / chain / batch orchestration
//! across many issues for one `run` invocation.
//!
//! Grounded on `dag/scheduler.rs`'s wave-based `PhaseStatus` computation and
//! fail-fast cascading, narrowed from "waves of phases within one DAG" to
//! "independent issues, each running its own phase sequence via
//! `IssueRunner`", plus the chain/qa-gate linking spec §4.6 adds on top.

use crate::dependency::{self, IssueNode, ResolveError};
use crate::errors::EngineError;
use crate::host::HostClient;
use crate::issue_runner::{IssueRunner, IssueRunnerConfig};
use crate::marker;
use crate::model::{Iid, IssueResult, IssueStatus, QaVerdict};
use crate::phase::PhaseTemplates;
use crate::phase_executor::PhaseExecutor;
use crate::state::StateStore;
use crate::worktree::WorktreeManager;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

/// Resolved orchestration mode for one `run` invocation (spec §4.6). `Batch`
/// groups are sequential with respect to each other and parallel within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleMode {
    Parallel,
    Sequential,
    Chain,
    Batch(Vec<Vec<Iid>>),
}

/// What the pre-flight dependency check found among the requested issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightOutcome {
    Clear,
    /// Parallel mode with cross-issue dependency edges: the scheduler
    /// refuses to run until the operator picks `--sequential` or
    /// `--force-parallel`.
    RefuseAmbiguousParallel { edges: Vec<(Iid, Iid)> },
}

/// Resolve the orchestration mode from the config flags, preferring the
/// most specific explicit request. `batches` is `Some` only when the
/// operator passed one or more `--batch` groups.
pub fn resolve_mode(
    chain: bool,
    sequential: bool,
    batches: Option<Vec<Vec<Iid>>>,
) -> ScheduleMode {
    if let Some(groups) = batches {
        return ScheduleMode::Batch(groups);
    }
    if chain {
        return ScheduleMode::Chain;
    }
    if sequential {
        return ScheduleMode::Sequential;
    }
    ScheduleMode::Parallel
}

/// §4.6 pre-flight: parallel mode with more than one issue refuses to run
/// if the Dependency Resolver finds edges among the requested set, unless
/// the operator passed `--force-parallel`.
pub fn preflight(
    mode: &ScheduleMode,
    force_parallel: bool,
    nodes: &[IssueNode],
) -> PreflightOutcome {
    if !matches!(mode, ScheduleMode::Parallel) || force_parallel || nodes.len() < 2 {
        return PreflightOutcome::Clear;
    }
    let requested: std::collections::HashSet<Iid> = nodes.iter().map(|n| n.number).collect();
    let edges: Vec<(Iid, Iid)> = nodes
        .iter()
        .flat_map(|n| {
            n.depends_on
                .iter()
                .filter(|d| requested.contains(d))
                .map(move |d| (*d, n.number))
        })
        .collect();
    if edges.is_empty() {
        PreflightOutcome::Clear
    } else {
        PreflightOutcome::RefuseAmbiguousParallel { edges }
    }
}

/// Issues in the requested set whose declared dependencies include `iid`
/// directly, used only to warn the operator (spec §4.6: "on failure, warn
/// about dependent issues but continue").
fn direct_dependents_of(iid: Iid, nodes: &[IssueNode]) -> Vec<Iid> {
    nodes
        .iter()
        .filter(|n| n.depends_on.contains(&iid))
        .map(|n| n.number)
        .collect()
}

/// Order issues for sequential/chain modes. Fatal on a dependency cycle.
pub fn order_issues(nodes: &[IssueNode]) -> Result<Vec<Iid>, EngineError> {
    dependency::topological_order(nodes).map_err(|ResolveError::Cycle(issues)| {
        EngineError::DependencyCycle { issues }
    })
}

/// Resources shared across one `run` invocation's issues, handed to every
/// `IssueRunner`. Kept as one bundle so `Scheduler::run` doesn't thread ten
/// positional arguments through every mode's driving loop.
pub struct Scheduler<'a> {
    pub executor: &'a PhaseExecutor,
    pub worktrees: &'a WorktreeManager,
    pub host: &'a HostClient,
    pub templates: &'a PhaseTemplates,
    pub state: &'a tokio::sync::Mutex<StateStore>,
    pub run_log: &'a tokio::sync::Mutex<crate::runlog::RunLogWriter>,
    pub shutdown: CancellationToken,
}

impl<'a> Scheduler<'a> {
    fn issue_runner(&self) -> IssueRunner<'a> {
        IssueRunner {
            executor: self.executor,
            worktrees: self.worktrees,
            host: self.host,
            templates: self.templates,
        }
    }

    /// Reconcile `ready_for_merge` issues to `merged` before any phase runs
    /// (spec §4.1). Best-effort: a host failure here just means nothing
    /// reconciles this run, it is retried next run.
    pub async fn reconcile_at_startup(&self, base_branch: &str) {
        if let Ok((merged_prs, merged_branches)) = crate::host::list_merged(self.host, base_branch).await
        {
            self.state
                .lock()
                .await
                .reconcile_merged(&merged_branches, &merged_prs);
        }
    }

    async fn fetch_nodes(&self, issues: &[Iid]) -> Result<Vec<(IssueNode, crate::host::IssueDetails)>, EngineError> {
        let mut out = Vec::with_capacity(issues.len());
        for &iid in issues {
            let details = self.host.view_issue(iid).await.map_err(EngineError::from)?;
            let mut deps = dependency::parse_body_dependencies(&details.body);
            deps.extend(dependency::parse_label_dependencies(&details.label_names()));
            out.push((IssueNode { number: iid, depends_on: deps }, details));
        }
        Ok(out)
    }

    async fn run_one(
        &self,
        issue: &crate::host::IssueDetails,
        run_config: &IssueRunnerConfig,
        phases: Vec<crate::model::Phase>,
        phases_explicit: bool,
        quality_loop_enabled: bool,
        chain_base: Option<&str>,
    ) -> Result<IssueResult, EngineError> {
        self.issue_runner()
            .run_issue(
                issue,
                phases,
                phases_explicit,
                quality_loop_enabled,
                run_config,
                self.state,
                self.run_log,
                self.shutdown.clone(),
                chain_base,
            )
            .await
    }

    /// Drive `issues` through the mode resolved from `config`. `phases` and
    /// `phases_explicit`/`quality_loop_enabled` are the same for every issue
    /// in one run (per-issue overrides come from label/recommended-workflow
    /// adjustment inside `IssueRunner`, not here).
    pub async fn run(
        &self,
        issues: Vec<Iid>,
        mode: ScheduleMode,
        run_config: IssueRunnerConfig,
        force_parallel: bool,
        phases: Vec<crate::model::Phase>,
        phases_explicit: bool,
        quality_loop_enabled: bool,
    ) -> Result<Vec<IssueResult>, EngineError> {
        let nodes_and_details = self.fetch_nodes(&issues).await?;
        let nodes: Vec<IssueNode> = nodes_and_details.iter().map(|(n, _)| n.clone()).collect();

        tracing::info!(issue_count = nodes.len(), mode = ?mode, "starting scheduler run");

        match preflight(&mode, force_parallel, &nodes) {
            PreflightOutcome::Clear => {}
            PreflightOutcome::RefuseAmbiguousParallel { edges } => {
                return Err(EngineError::DependencyCycle {
                    issues: edges.iter().flat_map(|(a, b)| [*a, *b]).collect(),
                });
            }
        }

        match mode {
            ScheduleMode::Parallel => {
                let futures = nodes_and_details.iter().map(|(_, details)| {
                    self.run_one(details, &run_config, phases.clone(), phases_explicit, quality_loop_enabled, None)
                });
                let results = join_all(futures).await;
                results.into_iter().collect()
            }
            ScheduleMode::Sequential => {
                let order = order_issues(&nodes)?;
                let mut results = Vec::with_capacity(order.len());
                for iid in order {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    let details = &nodes_and_details
                        .iter()
                        .find(|(n, _)| n.number == iid)
                        .expect("ordered issue was in requested set")
                        .1;
                    let result = self
                        .run_one(details, &run_config, phases.clone(), phases_explicit, quality_loop_enabled, None)
                        .await?;
                    if !result.success {
                        let dependents = direct_dependents_of(iid, &nodes);
                        if !dependents.is_empty() {
                            tracing::warn!(
                                issue = iid,
                                dependents = ?dependents,
                                "issue failed; dependent issues will still be attempted"
                            );
                        }
                    }
                    results.push(result);
                }
                Ok(results)
            }
            ScheduleMode::Chain => {
                let order = order_issues(&nodes)?;
                let mut results = Vec::with_capacity(order.len());
                let mut previous_branch: Option<String> = None;
                for iid in order {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    let details = &nodes_and_details
                        .iter()
                        .find(|(n, _)| n.number == iid)
                        .expect("ordered issue was in requested set")
                        .1;
                    let result = self
                        .run_one(
                            details,
                            &run_config,
                            phases.clone(),
                            phases_explicit,
                            quality_loop_enabled,
                            previous_branch.as_deref(),
                        )
                        .await?;

                    let qa_ok = result.success;
                    previous_branch = self
                        .state
                        .lock()
                        .await
                        .get_issue_state(iid)
                        .and_then(|s| s.branch.clone());
                    results.push(result);

                    if run_config.qa_gate && !qa_ok {
                        break; // remaining issues stay `not_started`
                    }
                }
                Ok(results)
            }
            ScheduleMode::Batch(groups) => {
                let mut results = Vec::new();
                for group in groups {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    let futures = group.iter().filter_map(|iid| {
                        nodes_and_details
                            .iter()
                            .find(|(n, _)| n.number == *iid)
                            .map(|(_, details)| {
                                self.run_one(
                                    details,
                                    &run_config,
                                    phases.clone(),
                                    phases_explicit,
                                    quality_loop_enabled,
                                    None,
                                )
                            })
                    });
                    let group_results: Result<Vec<_>, _> = join_all(futures).await.into_iter().collect();
                    results.extend(group_results?);
                }
                Ok(results)
            }
        }
    }
}

/// Query `getResumablePhases`-equivalent state for `--resume`: issues whose
/// comments show every requested phase already `completed` can be skipped
/// entirely rather than re-entering the runner.
pub fn issue_fully_resumed(requested: &[crate::model::Phase], comments: &[&str]) -> bool {
    let markers = marker::extract_all(comments.iter().copied());
    marker::resumable_phases(requested, &markers).is_empty()
}

/// Final roll-up used by the CLI summary (spec §7): whether every issue
/// result reports success.
pub fn all_succeeded(results: &[IssueResult]) -> bool {
    results.iter().all(|r| r.success)
}

/// True iff an issue's terminal status after a run permits calling it a
/// pass for exit-code purposes (matches the `QaVerdict::allows_submission`
/// gate that produced it).
pub fn issue_is_pass(status: IssueStatus) -> bool {
    matches!(
        status,
        IssueStatus::ReadyForMerge | IssueStatus::Merged | IssueStatus::WaitingForQaGate
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: Iid, deps: Vec<Iid>) -> IssueNode {
        IssueNode { number: n, depends_on: deps }
    }

    #[test]
    fn resolve_mode_batch_wins_over_everything() {
        let mode = resolve_mode(true, true, Some(vec![vec![1, 2]]));
        assert_eq!(mode, ScheduleMode::Batch(vec![vec![1, 2]]));
    }

    #[test]
    fn resolve_mode_chain_wins_over_sequential() {
        assert_eq!(resolve_mode(true, true, None), ScheduleMode::Chain);
    }

    #[test]
    fn resolve_mode_defaults_to_parallel() {
        assert_eq!(resolve_mode(false, false, None), ScheduleMode::Parallel);
    }

    #[test]
    fn preflight_clear_for_single_issue() {
        let nodes = vec![node(1, vec![])];
        assert_eq!(
            preflight(&ScheduleMode::Parallel, false, &nodes),
            PreflightOutcome::Clear
        );
    }

    #[test]
    fn preflight_refuses_parallel_with_internal_edges() {
        let nodes = vec![node(1, vec![]), node(2, vec![1])];
        let outcome = preflight(&ScheduleMode::Parallel, false, &nodes);
        assert!(matches!(outcome, PreflightOutcome::RefuseAmbiguousParallel { .. }));
    }

    #[test]
    fn preflight_force_parallel_overrides_refusal() {
        let nodes = vec![node(1, vec![]), node(2, vec![1])];
        assert_eq!(
            preflight(&ScheduleMode::Parallel, true, &nodes),
            PreflightOutcome::Clear
        );
    }

    #[test]
    fn preflight_ignores_edges_outside_requested_set() {
        let nodes = vec![node(1, vec![999])];
        assert_eq!(
            preflight(&ScheduleMode::Parallel, false, &nodes),
            PreflightOutcome::Clear
        );
    }

    #[test]
    fn preflight_is_clear_outside_parallel_mode() {
        let nodes = vec![node(1, vec![]), node(2, vec![1])];
        assert_eq!(
            preflight(&ScheduleMode::Sequential, false, &nodes),
            PreflightOutcome::Clear
        );
    }

    #[test]
    fn order_issues_surfaces_cycle_as_engine_error() {
        let nodes = vec![node(1, vec![2]), node(2, vec![1])];
        assert!(matches!(
            order_issues(&nodes),
            Err(EngineError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn chain_of_length_one_equals_parallel_with_one_issue() {
        // spec §8 boundary behavior: a single-issue chain visits exactly
        // that issue with no chain_base, same as parallel mode would.
        let nodes = vec![node(1, vec![])];
        let order = order_issues(&nodes).unwrap();
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn issue_is_pass_accepts_merge_eligible_statuses() {
        assert!(issue_is_pass(IssueStatus::ReadyForMerge));
        assert!(issue_is_pass(IssueStatus::Merged));
        assert!(issue_is_pass(IssueStatus::WaitingForQaGate));
        assert!(!issue_is_pass(IssueStatus::Blocked));
        assert!(!issue_is_pass(IssueStatus::NotStarted));
    }

    #[test]
    fn all_succeeded_is_false_if_any_issue_failed() {
        let mk = |n, success| IssueResult {
            issue_number: n,
            success,
            phase_results: vec![],
            loop_triggered: false,
            duration_seconds: 0.0,
            pr_number: None,
            pr_url: None,
            abort_reason: None,
        };
        assert!(all_succeeded(&[mk(1, true), mk(2, true)]));
        assert!(!all_succeeded(&[mk(1, true), mk(2, false)]));
    }
}
