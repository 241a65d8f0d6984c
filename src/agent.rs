//! Agent Runner: spawns the AI coding agent as a subprocess for one phase,
//! streams its JSON event protocol, and produces a typed outcome.
//!
//! Generalized from the teacher's `orchestrator/runner.rs` (piped stdio
//! `tokio::process::Command`, prompt-over-stdin, `BufReader::lines()` event
//! loop, periodic elapsed-time reporting task) and `stream/mod.rs`'s
//! `StreamEvent`/`ContentBlock` shapes, with cancellation added via
//! `tokio_util::sync::CancellationToken` (see `shutdown.rs`) in place of the
//! teacher's single iteration-budget loop, and `session_id` moved onto the
//! `system`/`init` message per the streaming protocol this agent speaks.

use crate::errors::{AgentError, CancelReason};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    System {
        subtype: String,
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    User {
        #[serde(default)]
        tool_use_result: Option<serde_json::Value>,
    },
    Result {
        subtype: String,
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        errors: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
        #[serde(default)]
        id: String,
    },
    Text {
        text: String,
    },
}

/// Outcome of one agent invocation, distinguishing *why* it didn't succeed
/// rather than collapsing everything into a boolean.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution { message: String },
    ErrorMaxBudget,
}

pub struct AgentInvocation {
    pub outcome: AgentOutcome,
    pub session_id: Option<String>,
    pub final_text: String,
    pub transcript: String,
    pub duration: Duration,
}

/// Where output lines are delivered as they stream in, so a caller (the
/// Renderer) can show progress without the agent module owning terminal
/// state.
pub trait AgentObserver: Send {
    fn on_tool_use(&mut self, _name: &str) {}
    fn on_text_chunk(&mut self, _text: &str) {}
    fn on_elapsed(&mut self, _elapsed: Duration) {}
}

pub struct NullObserver;
impl AgentObserver for NullObserver {}

pub struct AgentConfig {
    pub command: String,
    pub skip_permissions: bool,
    pub mcp_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            skip_permissions: true,
            mcp_enabled: true,
        }
    }
}

impl AgentConfig {
    fn flags(&self) -> Vec<&str> {
        let mut flags = vec!["--print", "--output-format", "stream-json", "--verbose"];
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions");
        }
        if !self.mcp_enabled {
            flags.push("--no-mcp");
        }
        flags
    }
}

/// Spawn the agent for one phase. `session_id` resumes a prior conversation
/// when `Some` (invalid across a `cwd` change, per the caller's contract);
/// `cancel` is a child token from `ShutdownManager`, cancelled on timeout or
/// process-wide shutdown.
pub async fn run(
    config: &AgentConfig,
    prompt: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    session_id: Option<&str>,
    cancel: CancellationToken,
    observer: &mut dyn AgentObserver,
) -> Result<AgentInvocation, AgentError> {
    let mut args: Vec<String> = config.flags().into_iter().map(String::from).collect();
    if let Some(sid) = session_id {
        args.push("--resume".to_string());
        args.push(sid.to_string());
    }

    let mut command = Command::new(&config.command);
    command
        .args(&args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::info!(command = %config.command, resuming = session_id.is_some(), "spawning agent");
    let mut child = command.spawn().map_err(AgentError::SpawnFailed)?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let prompt_owned = prompt.to_string();
    let write_task = tokio::spawn(async move {
        let _ = stdin.write_all(prompt_owned.as_bytes()).await;
        let _ = stdin.shutdown().await;
    });

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    let started = Instant::now();
    let mut resolved_session_id = session_id.map(str::to_string);
    let mut final_text = String::new();
    let mut transcript = String::new();
    let mut outcome = AgentOutcome::ErrorDuringExecution {
        message: "agent produced no result event".to_string(),
    };

    let elapsed_ticker = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                write_task.abort();
                elapsed_ticker.abort();
                let reason = if cancel.is_cancelled() { CancelReason::Shutdown } else { CancelReason::Timeout };
                return Err(AgentError::Cancelled { reason });
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break; };
                if line.trim().is_empty() {
                    continue;
                }
                transcript.push_str(&line);
                transcript.push('\n');
                match serde_json::from_str::<StreamEvent>(&line) {
                    Ok(StreamEvent::System { session_id: Some(sid), .. }) => {
                        resolved_session_id = Some(sid);
                    }
                    Ok(StreamEvent::System { .. }) => {}
                    Ok(StreamEvent::Assistant { message }) => {
                        for block in message.content {
                            match block {
                                ContentBlock::ToolUse { name, .. } => observer.on_tool_use(&name),
                                ContentBlock::Text { text } => {
                                    observer.on_text_chunk(&text);
                                    final_text.push_str(&text);
                                }
                            }
                        }
                    }
                    Ok(StreamEvent::User { .. }) => {}
                    Ok(StreamEvent::Result { subtype, result, is_error, errors }) => {
                        outcome = classify_result(&subtype, is_error, &errors);
                        if let Some(r) = result {
                            final_text = r;
                        }
                    }
                    Err(_) => {
                        final_text.push_str(&line);
                    }
                }
            }
        }
        observer.on_elapsed(started.elapsed());
    }

    elapsed_ticker.abort();
    let _ = child.wait().await.map_err(AgentError::SpawnFailed)?;

    tracing::info!(outcome = ?outcome, elapsed_secs = started.elapsed().as_secs_f64(), "agent invocation finished");

    Ok(AgentInvocation {
        outcome,
        session_id: resolved_session_id,
        final_text,
        transcript,
        duration: started.elapsed(),
    })
}

fn classify_result(subtype: &str, is_error: bool, errors: &[String]) -> AgentOutcome {
    match subtype {
        "success" if !is_error => AgentOutcome::Success,
        "error_max_turns" => AgentOutcome::ErrorMaxTurns,
        "error_max_budget_usd" => AgentOutcome::ErrorMaxBudget,
        _ => AgentOutcome::ErrorDuringExecution {
            message: if errors.is_empty() {
                format!("agent reported {subtype}")
            } else {
                errors.join("; ")
            },
        },
    }
}
