//! Phase Executor: runs one phase of one issue through the agent, extracts
//! a QA verdict if present, and wraps the whole thing in the cold-start and
//! MCP-fallback retry policy.
//!
//! Grounded on the teacher's single-iteration `ClaudeRunner::run_iteration`
//! (`orchestrator/runner.rs`) for the spawn-and-collect shape, generalized
//! to sequant's typed `Phase`/`PhaseResult` model and given an explicit
//! retry wrapper the teacher's promise-tag loop didn't need.

use crate::agent::{self, AgentConfig, AgentObserver, AgentOutcome, NullObserver};
use crate::model::{Phase, PhaseResult, QaVerdict};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn verdict_res() -> &'static [regex::Regex] {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Covers all four marker forms from spec §4.4: `### Verdict: X`,
        // `**Verdict:** X`, `**Verdict:** **X**`, `Verdict: X` — the value
        // itself may optionally be wrapped in its own pair of `**`.
        [
            r"(?im)^###\s*Verdict:\s*\*{0,2}([A-Za-z_-]+)\*{0,2}\s*$",
            r"(?im)^\*\*Verdict:\*\*\s*\*{0,2}([A-Za-z_-]+)\*{0,2}\s*$",
            r"(?im)^Verdict:\s*\*{0,2}([A-Za-z_-]+)\*{0,2}\s*$",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static verdict pattern"))
        .collect()
    })
}

/// First matching verdict marker, checked in order of specificity. Returns
/// `None` if the agent's output never declared one.
pub fn extract_verdict(output: &str) -> Option<QaVerdict> {
    for re in verdict_res() {
        if let Some(caps) = re.captures(output) {
            if let Some(verdict) = QaVerdict::from_str_loose(&caps[1]) {
                return Some(verdict);
            }
        }
    }
    None
}

/// A cold start (agent binary not yet warmed, MCP servers still connecting)
/// looks like a failure inside this many seconds of wall clock.
const COLD_START_WINDOW: Duration = Duration::from_secs(60);
const MAX_COLD_START_RETRIES: u32 = 2;

/// Whether a failure at `duration_secs` should be treated as a cold-start
/// artifact (spec §8: 59.9s retried, 60.0s not retried — the window is a
/// strict upper bound, not inclusive).
fn is_cold_start(duration_secs: f64) -> bool {
    duration_secs < COLD_START_WINDOW.as_secs_f64()
}

pub struct PhaseExecutor {
    config: AgentConfig,
}

impl PhaseExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run `phase` for `issue` once: no retry policy, no verdict rewrite.
    /// Used directly by `execute_with_retry`; exposed for callers that want
    /// the raw single attempt (e.g. the `phase` single-shot CLI command).
    pub async fn execute_once(
        &self,
        phase: Phase,
        prompt: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        session_id: Option<&str>,
        cancel: CancellationToken,
        observer: &mut dyn AgentObserver,
    ) -> (PhaseResult, Option<String>) {
        let started = Instant::now();
        match agent::run(&self.config, prompt, cwd, env, session_id, cancel, observer).await {
            Ok(invocation) => {
                let duration_seconds = started.elapsed().as_secs_f64();
                let verdict = extract_verdict(&invocation.final_text);
                let mut success = matches!(invocation.outcome, AgentOutcome::Success);
                let mut error = None;

                if phase == Phase::Qa {
                    if success {
                        match &verdict {
                            Some(v) if v.allows_submission() => {}
                            Some(v) => {
                                success = false;
                                error = Some(format!("QA verdict: {v}"));
                            }
                            None => {
                                success = false;
                                error = Some("agent produced no QA verdict marker".to_string());
                            }
                        }
                    }
                }

                if !success && error.is_none() {
                    error = Some(match &invocation.outcome {
                        AgentOutcome::Success => unreachable!(),
                        AgentOutcome::ErrorMaxTurns => "agent hit its maximum turn limit".to_string(),
                        AgentOutcome::ErrorMaxBudget => "agent hit its budget limit".to_string(),
                        AgentOutcome::ErrorDuringExecution { message } => message.clone(),
                    });
                }

                (
                    PhaseResult {
                        phase,
                        success,
                        duration_seconds,
                        error,
                        output: Some(invocation.final_text),
                        verdict,
                        session_id: invocation.session_id.clone(),
                    },
                    invocation.session_id,
                )
            }
            Err(crate::errors::AgentError::Cancelled { reason }) => (
                PhaseResult {
                    phase,
                    success: false,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    error: Some(format!("cancelled: {reason:?}")),
                    output: None,
                    verdict: None,
                    session_id: session_id.map(str::to_string),
                },
                session_id.map(str::to_string),
            ),
            Err(e) => (
                PhaseResult {
                    phase,
                    success: false,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    error: Some(e.to_string()),
                    output: None,
                    verdict: None,
                    session_id: session_id.map(str::to_string),
                },
                session_id.map(str::to_string),
            ),
        }
    }

    /// Execute with the cold-start and MCP-fallback retry policy: a failure
    /// inside the first `COLD_START_WINDOW` is retried (without a session id,
    /// since a cold-start failure usually means none was established) up to
    /// `MAX_COLD_START_RETRIES` times; a failure past that window is retried
    /// once more with MCP disabled before giving up.
    pub async fn execute_with_retry(
        &self,
        phase: Phase,
        prompt: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        session_id: Option<&str>,
        cancel: CancellationToken,
        retry_enabled: bool,
    ) -> (PhaseResult, Option<String>) {
        let mut observer = NullObserver;
        let (mut result, mut sid) = self
            .execute_once(phase, prompt, cwd, env, session_id, cancel.clone(), &mut observer)
            .await;

        if !retry_enabled || result.success || cancel.is_cancelled() {
            return (result, sid);
        }

        if is_cold_start(result.duration_seconds) {
            tracing::warn!(
                phase = %phase,
                duration_seconds = result.duration_seconds,
                "phase failed inside the cold-start window, retrying"
            );
            for _ in 0..MAX_COLD_START_RETRIES {
                let (retry_result, retry_sid) = self
                    .execute_once(phase, prompt, cwd, env, None, cancel.clone(), &mut observer)
                    .await;
                if retry_result.success {
                    return (retry_result, retry_sid);
                }
                result = retry_result;
                sid = retry_sid;
                if cancel.is_cancelled() {
                    return (result, sid);
                }
            }
        }

        if self.config.mcp_enabled {
            tracing::warn!(phase = %phase, "retrying with MCP disabled after exhausting cold-start retries");
            let fallback_config = AgentConfig {
                command: self.config.command.clone(),
                skip_permissions: self.config.skip_permissions,
                mcp_enabled: false,
            };
            let fallback_executor = PhaseExecutor::new(fallback_config);
            let (fallback_result, fallback_sid) = fallback_executor
                .execute_once(phase, prompt, cwd, env, sid.as_deref(), cancel, &mut observer)
                .await;
            if fallback_result.success {
                return (fallback_result, fallback_sid);
            }
            // Fallback also failed: the original attempt's error is more
            // diagnostic (it ran with the full tool set), so surface that
            // instead of the fallback's.
            return (result, sid);
        }

        (result, sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_heading_style_verdict() {
        let output = "some analysis\n### Verdict: READY_FOR_MERGE\n";
        assert_eq!(extract_verdict(output), Some(QaVerdict::ReadyForMerge));
    }

    #[test]
    fn extracts_bold_style_verdict() {
        let output = "**Verdict:** ac-not-met";
        assert_eq!(extract_verdict(output), Some(QaVerdict::AcNotMet));
    }

    #[test]
    fn extracts_plain_style_verdict() {
        let output = "Verdict: needs_verification";
        assert_eq!(extract_verdict(output), Some(QaVerdict::NeedsVerification));
    }

    #[test]
    fn extracts_bold_wrapped_value_verdict() {
        let output = "**Verdict:** **AC_MET_BUT_NOT_A_PLUS**";
        assert_eq!(
            extract_verdict(output),
            Some(QaVerdict::AcMetButNotAPlus)
        );
    }

    #[test]
    fn no_verdict_marker_returns_none() {
        assert_eq!(extract_verdict("no markers here"), None);
    }

    #[test]
    fn first_matching_pattern_wins_when_multiple_present() {
        let output = "### Verdict: READY_FOR_MERGE\nVerdict: ac_not_met";
        assert_eq!(extract_verdict(output), Some(QaVerdict::ReadyForMerge));
    }

    #[test]
    fn cold_start_boundary_is_strictly_under_sixty_seconds() {
        assert!(is_cold_start(59.9));
        assert!(!is_cold_start(60.0));
        assert!(!is_cold_start(60.1));
    }
}
