//! Core data model: phases, results, persisted state, and run logs.
//!
//! Shapes are grounded on `audit/mod.rs`'s `AuditRun`/`PhaseAudit`/
//! `IterationAudit` family, generalized from "one spec-driven run of
//! sequential phases" to "many issues, each independently phased,
//! scheduled across a run".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type Iid = u64;

/// The closed set of phase tags the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Spec,
    SecurityReview,
    Testgen,
    Exec,
    Test,
    Verify,
    Qa,
    Loop,
    Merger,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Spec,
        Phase::SecurityReview,
        Phase::Testgen,
        Phase::Exec,
        Phase::Test,
        Phase::Verify,
        Phase::Qa,
        Phase::Loop,
        Phase::Merger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Spec => "spec",
            Phase::SecurityReview => "security-review",
            Phase::Testgen => "testgen",
            Phase::Exec => "exec",
            Phase::Test => "test",
            Phase::Verify => "verify",
            Phase::Qa => "qa",
            Phase::Loop => "loop",
            Phase::Merger => "merger",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Phase> {
        let normalized = s.trim().to_ascii_lowercase();
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
    }

    /// Whether this phase must run inside the issue's worktree rather than
    /// the main checkout. Only `spec` runs against the main checkout: it
    /// reasons about the issue before any workspace exists.
    pub fn isolated(&self) -> bool {
        !matches!(self, Phase::Spec)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The four QA verdict values the `qa` phase can conclude with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaVerdict {
    ReadyForMerge,
    AcMetButNotAPlus,
    AcNotMet,
    NeedsVerification,
}

impl QaVerdict {
    /// Verdicts that permit the pre-submission flow to run.
    pub fn allows_submission(&self) -> bool {
        matches!(self, QaVerdict::ReadyForMerge | QaVerdict::NeedsVerification)
    }

    /// SCREAMING_SNAKE_CASE rendering, matching the serde representation and
    /// the verdict marker wire format.
    pub fn as_str(&self) -> &'static str {
        match self {
            QaVerdict::ReadyForMerge => "READY_FOR_MERGE",
            QaVerdict::AcMetButNotAPlus => "AC_MET_BUT_NOT_A_PLUS",
            QaVerdict::AcNotMet => "AC_NOT_MET",
            QaVerdict::NeedsVerification => "NEEDS_VERIFICATION",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<QaVerdict> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "READY_FOR_MERGE" => Some(QaVerdict::ReadyForMerge),
            "AC_MET_BUT_NOT_A_PLUS" => Some(QaVerdict::AcMetButNotAPlus),
            "AC_NOT_MET" => Some(QaVerdict::AcNotMet),
            "NEEDS_VERIFICATION" => Some(QaVerdict::NeedsVerification),
            _ => None,
        }
    }
}

impl std::fmt::Display for QaVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single phase invocation for a single issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub success: bool,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub output: Option<String>,
    pub verdict: Option<QaVerdict>,
    pub session_id: Option<String>,
}

/// Outcome of driving one issue through its full phase plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResult {
    pub issue_number: Iid,
    pub success: bool,
    pub phase_results: Vec<PhaseResult>,
    pub loop_triggered: bool,
    pub duration_seconds: f64,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: Option<PhaseStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub iteration: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    NotStarted,
    InProgress,
    WaitingForQaGate,
    ReadyForMerge,
    Merged,
    Blocked,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub enabled: bool,
    pub iteration: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueState {
    pub number: Iid,
    pub title: String,
    pub status: IssueStatus,
    pub worktree: Option<std::path::PathBuf>,
    pub branch: Option<String>,
    pub current_phase: Option<Phase>,
    pub phases: BTreeMap<Phase, PhaseState>,
    pub pr: Option<PrInfo>,
    pub r#loop: Option<LoopState>,
    pub session_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IssueState {
    pub fn new(number: Iid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            number,
            title: title.into(),
            status: IssueStatus::NotStarted,
            worktree: None,
            branch: None,
            current_phase: None,
            phases: BTreeMap::new(),
            pr: None,
            r#loop: None,
            session_id: None,
            last_activity: now,
            created_at: now,
        }
    }
}

// BTreeMap requires Ord on the key; Phase derives Hash/Eq but not Ord, so
// provide a stable ordering matching declaration order in `Phase::ALL`.
impl PartialOrd for Phase {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Phase {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(p: &Phase) -> usize {
            Phase::ALL.iter().position(|x| x == p).unwrap_or(usize::MAX)
        }
        rank(self).cmp(&rank(other))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub issues: BTreeMap<Iid, IssueState>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            version: 1,
            last_updated: Utc::now(),
            issues: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPhaseStatus {
    Success,
    Failure,
    Timeout,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLog {
    pub phase: Phase,
    pub issue_number: Iid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: LogPhaseStatus,
    pub error: Option<String>,
    pub iterations: Option<u32>,
    pub files_modified: Option<Vec<std::path::PathBuf>>,
    pub file_diff_stats: Option<FileDiffStats>,
    pub commit_hash: Option<String>,
    pub cache_metrics: Option<serde_json::Value>,
    pub verdict: Option<QaVerdict>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDiffStats {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogIssueStatus {
    Success,
    Failure,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLog {
    pub issue_number: Iid,
    pub title: String,
    pub labels: Vec<String>,
    pub status: LogIssueStatus,
    pub phases: Vec<PhaseLog>,
    pub total_duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_reason: Option<String>,
}

impl IssueLog {
    fn new(issue_number: Iid, title: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            issue_number,
            title: title.into(),
            labels,
            status: LogIssueStatus::Success,
            phases: Vec::new(),
            total_duration_seconds: 0.0,
            crash_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogSummary {
    pub total_issues: usize,
    pub passed: usize,
    pub failed: usize,
    pub total_duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogConfig {
    pub phases: Vec<Phase>,
    pub sequential: bool,
    pub quality_loop: bool,
    pub max_iterations: u32,
    pub base_branch: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub version: u32,
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub config: RunLogConfig,
    pub issues: Vec<IssueLog>,
    pub summary: Option<RunLogSummary>,
    #[serde(skip)]
    pub(crate) in_progress: Option<IssueLog>,
}

impl RunLog {
    pub fn new(config: RunLogConfig) -> Self {
        Self {
            version: 1,
            run_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            config,
            issues: Vec::new(),
            summary: None,
            in_progress: None,
        }
    }

    pub fn start_issue(&mut self, iid: Iid, title: impl Into<String>, labels: Vec<String>) {
        if self.in_progress.is_some() {
            self.complete_issue();
        }
        self.in_progress = Some(IssueLog::new(iid, title, labels));
    }

    pub fn log_phase(&mut self, entry: PhaseLog) {
        let Some(issue) = self.in_progress.as_mut() else {
            return;
        };
        match entry.status {
            LogPhaseStatus::Failure => issue.status = LogIssueStatus::Failure,
            LogPhaseStatus::Timeout if issue.status != LogIssueStatus::Failure => {
                issue.status = LogIssueStatus::Partial
            }
            _ => {}
        }
        issue.phases.push(entry);
    }

    pub fn complete_issue(&mut self) {
        if let Some(mut issue) = self.in_progress.take() {
            issue.total_duration_seconds =
                issue.phases.iter().map(|p| p.duration_seconds).sum();
            self.issues.push(issue);
        }
    }

    /// Mark whatever issue is currently in-flight as failed with `reason`
    /// (spec §7: a SIGINT/SIGTERM handler marks active runs failed with
    /// reason `process_crash` before exit) and flush it into `issues`.
    /// No-op if nothing is in progress.
    pub fn mark_in_flight_failed(&mut self, reason: &str) {
        if let Some(issue) = self.in_progress.as_mut() {
            issue.status = LogIssueStatus::Failure;
            issue.crash_reason = Some(reason.to_string());
        }
        self.complete_issue();
    }

    pub fn finalize(&mut self) -> RunLogSummary {
        self.complete_issue();
        self.end_time = Some(Utc::now());
        let passed = self
            .issues
            .iter()
            .filter(|i| i.status == LogIssueStatus::Success)
            .count();
        let failed = self
            .issues
            .iter()
            .filter(|i| i.status == LogIssueStatus::Failure)
            .count();
        let summary = RunLogSummary {
            total_issues: self.issues.len(),
            passed,
            failed,
            total_duration_seconds: self.issues.iter().map(|i| i.total_duration_seconds).sum(),
        };
        self.summary = Some(summary.clone());
        summary
    }
}

/// Status value embedded in a Phase Marker Protocol comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMarker {
    pub phase: Phase,
    pub status: MarkerStatus,
    pub timestamp: DateTime<Utc>,
    pub pr: Option<PrInfo>,
    pub error: Option<String>,
}

/// Descriptor for one issue's isolated git worktree.
#[derive(Debug, Clone)]
pub struct WorktreeDescriptor {
    pub issue: Iid,
    pub path: std::path::PathBuf,
    pub branch: String,
    pub existed: bool,
    pub rebased: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for p in Phase::ALL {
            assert_eq!(Phase::from_str_loose(p.as_str()), Some(p));
        }
    }

    #[test]
    fn phase_spec_is_not_isolated_others_are() {
        assert!(!Phase::Spec.isolated());
        assert!(Phase::Exec.isolated());
        assert!(Phase::Qa.isolated());
    }

    #[test]
    fn qa_verdict_parses_hyphen_and_underscore_and_case() {
        assert_eq!(
            QaVerdict::from_str_loose("ready-for-merge"),
            Some(QaVerdict::ReadyForMerge)
        );
        assert_eq!(
            QaVerdict::from_str_loose("Needs_Verification"),
            Some(QaVerdict::NeedsVerification)
        );
        assert_eq!(QaVerdict::from_str_loose("bogus"), None);
    }

    #[test]
    fn qa_verdict_submission_gate() {
        assert!(QaVerdict::ReadyForMerge.allows_submission());
        assert!(QaVerdict::NeedsVerification.allows_submission());
        assert!(!QaVerdict::AcNotMet.allows_submission());
        assert!(!QaVerdict::AcMetButNotAPlus.allows_submission());
    }

    #[test]
    fn run_log_tracks_issue_status_across_phases() {
        let config = RunLogConfig {
            phases: vec![Phase::Exec, Phase::Qa],
            sequential: false,
            quality_loop: false,
            max_iterations: 1,
            base_branch: "main".into(),
            dry_run: false,
        };
        let mut log = RunLog::new(config);
        log.start_issue(1, "Fix thing", vec!["bug".into()]);
        log.log_phase(PhaseLog {
            phase: Phase::Exec,
            issue_number: 1,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_seconds: 1.0,
            status: LogPhaseStatus::Success,
            error: None,
            iterations: None,
            files_modified: None,
            file_diff_stats: None,
            commit_hash: None,
            cache_metrics: None,
            verdict: None,
        });
        log.log_phase(PhaseLog {
            phase: Phase::Qa,
            issue_number: 1,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_seconds: 2.0,
            status: LogPhaseStatus::Failure,
            error: Some("boom".into()),
            iterations: None,
            files_modified: None,
            file_diff_stats: None,
            commit_hash: None,
            cache_metrics: None,
            verdict: Some(QaVerdict::AcNotMet),
        });
        let summary = log.finalize();
        assert_eq!(summary.total_issues, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 0);
        assert_eq!(log.issues[0].total_duration_seconds, 3.0);
    }

    #[test]
    fn run_log_summary_counts_exclude_partial_from_passed_and_failed() {
        let config = RunLogConfig {
            phases: vec![Phase::Exec],
            sequential: false,
            quality_loop: false,
            max_iterations: 1,
            base_branch: "main".into(),
            dry_run: false,
        };
        let mut log = RunLog::new(config);
        log.start_issue(1, "a", vec![]);
        log.log_phase(PhaseLog {
            phase: Phase::Exec,
            issue_number: 1,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_seconds: 1.0,
            status: LogPhaseStatus::Timeout,
            error: None,
            iterations: None,
            files_modified: None,
            file_diff_stats: None,
            commit_hash: None,
            cache_metrics: None,
            verdict: None,
        });
        let summary = log.finalize();
        assert_eq!(summary.passed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.total_issues, 1);
    }
}
