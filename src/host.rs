//! Host Client: talks to the issue tracker / pull-request host exclusively
//! through the `gh` CLI subprocess, per spec §6's external-interface list.
//!
//! Subprocess-spawn idiom and timeout handling are grounded on
//! `orchestrator/runner.rs` (piped `tokio::process::Command`, `anyhow::Context`
//! wrapped failures); the issue/PR field shapes mirror `factory/github.rs`'s
//! `GitHubIssue` (that file itself talks over `reqwest`, which this client
//! deliberately does not use).

use crate::errors::HostError;
use anyhow::{Result, bail};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct IssueDetails {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestDetails {
    pub number: u64,
    pub url: String,
    pub state: String,
}

impl IssueDetails {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    pub fn comment_bodies(&self) -> Vec<&str> {
        self.comments.iter().map(|c| c.body.as_str()).collect()
    }
}

pub struct HostClient {
    project_dir: std::path::PathBuf,
}

impl HostClient {
    pub fn new(project_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    async fn run(&self, args: &[&str], deadline: Duration) -> Result<String, HostError> {
        let op = args.join(" ");
        let output = timeout(
            deadline,
            Command::new("gh")
                .args(args)
                .current_dir(&self.project_dir)
                .output(),
        )
        .await
        .map_err(|_| HostError::SubprocessFailed {
            op: op.clone(),
            stderr: format!("timed out after {}s", deadline.as_secs()),
        })?
        .map_err(|e| HostError::SubprocessFailed {
            op: op.clone(),
            stderr: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("no issues found") || stderr.contains("not found") {
                return Err(HostError::NotFound(op));
            }
            return Err(HostError::SubprocessFailed { op, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Fetch title, labels, body and comments for an issue. Fails hard: the
    /// caller cannot run a phase without the issue description.
    pub async fn view_issue(&self, issue: u64) -> Result<IssueDetails, HostError> {
        let raw = self
            .run(
                &[
                    "issue",
                    "view",
                    &issue.to_string(),
                    "--json",
                    "number,title,body,labels,comments",
                ],
                SHORT_TIMEOUT,
            )
            .await?;
        serde_json::from_str(&raw).map_err(HostError::ParseFailed)
    }

    /// Post a progress/result comment. Best-effort: failures are logged by
    /// the caller as warnings, never abort a phase.
    pub async fn post_comment(&self, issue: u64, body: &str) -> Result<()> {
        match self
            .run(
                &["issue", "comment", &issue.to_string(), "--body", body],
                SHORT_TIMEOUT,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => bail!(e),
        }
    }

    /// Look up an open PR for `branch`, if one exists.
    pub async fn find_pr_for_branch(
        &self,
        branch: &str,
    ) -> Result<Option<PullRequestDetails>, HostError> {
        match self
            .run(
                &[
                    "pr",
                    "view",
                    branch,
                    "--json",
                    "number,url,state",
                ],
                SHORT_TIMEOUT,
            )
            .await
        {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(HostError::ParseFailed),
            Err(HostError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a PR from the current branch in `worktree_path` against `base`.
    /// Long timeout: `gh pr create` may push and round-trip with the host.
    pub async fn create_pr(
        &self,
        worktree_path: &std::path::Path,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestDetails, HostError> {
        let raw = timeout(
            LONG_TIMEOUT,
            Command::new("gh")
                .args([
                    "pr", "create", "--base", base, "--title", title, "--body", body,
                    "--json", "number,url,state",
                ])
                .current_dir(worktree_path)
                .output(),
        )
        .await
        .map_err(|_| HostError::SubprocessFailed {
            op: "pr create".into(),
            stderr: format!("timed out after {}s", LONG_TIMEOUT.as_secs()),
        })?
        .map_err(|e| HostError::SubprocessFailed {
            op: "pr create".into(),
            stderr: e.to_string(),
        })?;

        if !raw.status.success() {
            return Err(HostError::SubprocessFailed {
                op: "pr create".into(),
                stderr: String::from_utf8_lossy(&raw.stderr).to_string(),
            });
        }
        serde_json::from_slice(&raw.stdout).map_err(HostError::ParseFailed)
    }
}

/// Does a `gh pr create` failure mean "a PR for this branch already exists"?
/// `gh` reports this as a non-zero exit with a message like "a pull request
/// for branch ... already exists" rather than a distinct exit code.
pub fn is_pr_already_exists_conflict(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already exists")
}

/// Are merged-branch names reported back from the host in a `merged_branches`
/// snapshot? `reconcile_merged` (state.rs) only needs the list of branch
/// names and PR numbers; list merged PRs against `base`.
pub async fn list_merged(
    client: &HostClient,
    base: &str,
) -> Result<(Vec<u64>, Vec<String>), HostError> {
    #[derive(Deserialize)]
    struct MergedPr {
        number: u64,
        #[serde(rename = "headRefName")]
        head_ref_name: String,
    }
    let raw = client
        .run(
            &[
                "pr",
                "list",
                "--base",
                base,
                "--state",
                "merged",
                "--json",
                "number,headRefName",
            ],
            SHORT_TIMEOUT,
        )
        .await?;
    let prs: Vec<MergedPr> = serde_json::from_str(&raw).map_err(HostError::ParseFailed)?;
    let numbers = prs.iter().map(|p| p.number).collect();
    let branches = prs.into_iter().map(|p| p.head_ref_name).collect();
    Ok((numbers, branches))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_details_parses_labels_and_comments() {
        let json = r#"{
            "number": 42,
            "title": "Fix the bug",
            "body": "steps to reproduce",
            "labels": [{"name": "bug"}, {"name": "priority-high"}],
            "comments": [{"body": "depends-on #7"}]
        }"#;
        let issue: IssueDetails = serde_json::from_str(json).unwrap();
        assert_eq!(issue.number, 42);
        assert_eq!(issue.label_names(), vec!["bug", "priority-high"]);
        assert_eq!(issue.comment_bodies(), vec!["depends-on #7"]);
    }

    #[test]
    fn issue_details_defaults_missing_optional_fields() {
        let json = r#"{"number": 1, "title": "t"}"#;
        let issue: IssueDetails = serde_json::from_str(json).unwrap();
        assert!(issue.body.is_empty());
        assert!(issue.labels.is_empty());
        assert!(issue.comments.is_empty());
    }

    #[test]
    fn pr_already_exists_conflict_is_detected_case_insensitively() {
        assert!(is_pr_already_exists_conflict(
            "a pull request for branch \"feature/1-x\" into \"main\" already exists: https://example.test/pr/9"
        ));
        assert!(!is_pr_already_exists_conflict("permission denied"));
    }

    #[test]
    fn pull_request_details_round_trip() {
        let json = r#"{"number": 7, "url": "https://example.test/pr/7", "state": "OPEN"}"#;
        let pr: PullRequestDetails = serde_json::from_str(json).unwrap();
        assert_eq!(pr.number, 7);
        assert_eq!(pr.state, "OPEN");
    }
}
