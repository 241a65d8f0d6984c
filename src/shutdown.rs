//! Shutdown Manager: process-wide signal-driven graceful abort.
//!
//! Grounded on `tokio_util::sync::CancellationToken` as used for pipeline
//! abort in the retrieved corpus (`other_examples/.../phase-golem/src/executor.rs`),
//! combined with the teacher's `tokio::spawn` background-task idiom
//! (`orchestrator/runner.rs`'s elapsed-time updater). No direct shutdown-signal
//! precedent exists in the teacher; SIGINT/SIGTERM handling is synthesized from
//! `tokio::signal`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Reason the shutdown flag was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    ProcessCrash,
}

/// Process-wide shutdown coordination. One instance lives for the duration
/// of a `run` invocation; every concurrently running phase holds a clone of
/// its root `CancellationToken`.
#[derive(Clone)]
pub struct ShutdownManager {
    root: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install SIGINT/SIGTERM handlers that flip the shutdown flag, cancel
    /// every token derived from `root`, and mark whatever issue is
    /// currently in-flight in `run_log` failed with reason `process_crash`
    /// (spec §7) before the cooperative shutdown winds the run down.
    /// Spawns a background task; call once per run.
    pub fn install_signal_handlers(&self, run_log: Arc<tokio::sync::Mutex<crate::runlog::RunLogWriter>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            manager.request_shutdown();
            run_log.lock().await.mark_in_flight_failed("process_crash");
        });
    }

    /// Derive a child token for one phase invocation. Cancelling the root
    /// cancels every child; a child can also be cancelled individually
    /// (e.g. on a per-phase timeout) without affecting siblings.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.root.cancel();
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_shutdown_cancels_all_child_tokens() {
        let manager = ShutdownManager::new();
        let child_a = manager.child_token();
        let child_b = manager.child_token();
        assert!(!manager.is_shutting_down());
        manager.request_shutdown();
        assert!(manager.is_shutting_down());
        assert!(child_a.is_cancelled());
        assert!(child_b.is_cancelled());
    }

    #[tokio::test]
    async fn tokens_created_after_shutdown_are_already_cancelled() {
        let manager = ShutdownManager::new();
        manager.request_shutdown();
        let late_child = manager.child_token();
        assert!(late_child.is_cancelled());
    }

    #[tokio::test]
    async fn independent_managers_do_not_share_state() {
        let a = ShutdownManager::new();
        let b = ShutdownManager::new();
        a.request_shutdown();
        assert!(a.is_shutting_down());
        assert!(!b.is_shutting_down());
    }
}
