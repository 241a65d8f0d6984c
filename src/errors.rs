//! Typed error hierarchy for the sequant engine.
//!
//! One enum per subsystem, composed by `#[from]` into a top-level
//! `EngineError` at the scheduler/CLI boundary, rather than a single
//! god-enum.

use thiserror::Error;

/// Errors from the durable workflow state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in state file at {path}: {source}")]
    Serde {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("atomic write to {path} failed: {source}")]
    AtomicWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from worktree lifecycle management.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("failed to locate git repository at {path}: {message}")]
    GitOpen {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("rebase of branch {branch} onto base failed with conflicts")]
    RebaseConflict { branch: String },

    #[error("failed to remove worktree at {path}: {source}")]
    RemoveFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a git worktree")]
    NotAWorktree { path: std::path::PathBuf },
}

/// Reason a running agent invocation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Shutdown,
}

/// Errors from invoking the agent subprocess.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to write prompt to agent stdin: {0}")]
    StdinWriteFailed(#[source] std::io::Error),

    #[error("failed to parse agent stream event: {0}")]
    StreamParse(#[source] serde_json::Error),

    #[error("agent invocation cancelled: {reason:?}")]
    Cancelled { reason: CancelReason },
}

/// Errors from invoking the host (issue tracker / PR) subprocess client.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host subprocess for `{op}` failed: {stderr}")]
    SubprocessFailed { op: String, stderr: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to parse host subprocess output: {0}")]
    ParseFailed(#[source] serde_json::Error),
}

/// Top-level error surfaced across the scheduler/CLI boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("dependency cycle detected among issues: {issues:?}")]
    DependencyCycle { issues: Vec<u64> },

    #[error("unknown phase `{name}` requested")]
    UnknownPhase { name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_atomic_write_failed_carries_path() {
        let path = std::path::PathBuf::from("/project/.sequant/state.json");
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StateError::AtomicWriteFailed {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            StateError::AtomicWriteFailed { path: p, .. } => assert_eq!(p, &path),
            _ => panic!("expected AtomicWriteFailed"),
        }
    }

    #[test]
    fn worktree_error_rebase_conflict_is_matchable() {
        let err = WorktreeError::RebaseConflict {
            branch: "feature/42-fix".into(),
        };
        assert!(err.to_string().contains("feature/42-fix"));
    }

    #[test]
    fn engine_error_converts_from_state_error() {
        let inner = StateError::AtomicWriteFailed {
            path: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "x"),
        };
        let engine_err: EngineError = inner.into();
        assert!(matches!(engine_err, EngineError::State(_)));
    }

    #[test]
    fn engine_error_dependency_cycle_carries_issues() {
        let err = EngineError::DependencyCycle {
            issues: vec![1, 2, 3],
        };
        assert!(err.to_string().contains('1'));
    }

    #[test]
    fn agent_error_cancelled_is_matchable() {
        let err = AgentError::Cancelled {
            reason: CancelReason::Timeout,
        };
        assert!(matches!(
            err,
            AgentError::Cancelled {
                reason: CancelReason::Timeout
            }
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&HostError::NotFound("issue 1".into()));
        assert_std_error(&AgentError::Cancelled {
            reason: CancelReason::Shutdown,
        });
    }
}
