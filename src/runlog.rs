//! Run Log Writer: persists one structured `RunLog` per `run` invocation and
//! rotates the log directory afterward.
//!
//! Lifecycle (`initialize` → `start_issue`/`log_phase`/`complete_issue` →
//! `finalize`) is grounded on `audit/logger.rs`'s `AuditLogger` (start_run /
//! add_phase / finish_run, `ok_or_else` discipline on missing active run,
//! `fs::write` + `fs::create_dir_all` persistence idiom). The in-memory
//! `RunLog` accumulation logic itself lives on `crate::model::RunLog`.

use crate::model::{PhaseLog, RunLog, RunLogConfig, RunLogSummary};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Rotation thresholds for the run log directory. Checked after every
/// `finalize`.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub enabled: bool,
    pub max_size_mb: f64,
    pub max_files: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 10.0,
            max_files: 100,
        }
    }
}

/// Aggregate stats for a log directory, used both by rotation and by the
/// manual `--show-rotation-stats`-style operator command.
#[derive(Debug, Clone, Default)]
pub struct DirStats {
    pub total_bytes: u64,
    pub file_count: usize,
}

impl DirStats {
    pub fn total_mb(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

fn dir_stats(dir: &Path) -> Result<DirStats> {
    let mut stats = DirStats::default();
    if !dir.exists() {
        return Ok(stats);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {dir:?}"))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            stats.total_bytes += entry.metadata()?.len();
            stats.file_count += 1;
        }
    }
    Ok(stats)
}

fn json_files_oldest_first(dir: &Path) -> Result<Vec<(PathBuf, std::time::SystemTime, u64)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let meta = entry.metadata()?;
        files.push((path, meta.modified()?, meta.len()));
    }
    files.sort_by_key(|(_, modified, _)| *modified);
    Ok(files)
}

/// Files deleted by a rotation pass, for the `--dry-run` preview.
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    pub deleted: Vec<PathBuf>,
    pub before: DirStats,
    pub after: DirStats,
}

/// Delete oldest-first JSON files from `dir` until both size and count are
/// under 90% of the configured thresholds. The 10% buffer avoids rotating
/// again on the very next run.
pub fn rotate(dir: &Path, config: &RotationConfig, dry_run: bool) -> Result<RotationReport> {
    let before = dir_stats(dir)?;
    if !config.enabled {
        return Ok(RotationReport {
            deleted: Vec::new(),
            before: before.clone(),
            after: before,
        });
    }

    let size_limit = config.max_size_mb * 1024.0 * 1024.0;
    let count_limit = config.max_files as f64;

    if before.total_bytes as f64 <= size_limit && before.file_count as f64 <= count_limit {
        return Ok(RotationReport {
            deleted: Vec::new(),
            before: before.clone(),
            after: before,
        });
    }

    let target_size = size_limit * 0.9;
    let target_count = (count_limit * 0.9).floor() as usize;

    let files = json_files_oldest_first(dir)?;
    let mut remaining_bytes = before.total_bytes;
    let mut remaining_count = before.file_count;
    let mut deleted = Vec::new();

    for (path, _modified, len) in files {
        if remaining_bytes as f64 <= target_size && remaining_count <= target_count {
            break;
        }
        if !dry_run {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove stale run log {path:?}"))?;
        }
        remaining_bytes = remaining_bytes.saturating_sub(len);
        remaining_count = remaining_count.saturating_sub(1);
        deleted.push(path);
    }

    let after = if dry_run {
        DirStats {
            total_bytes: remaining_bytes,
            file_count: remaining_count,
        }
    } else {
        dir_stats(dir)?
    };

    Ok(RotationReport {
        deleted,
        before,
        after,
    })
}

fn safe_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339()
        .replace(':', "-")
        .replace('.', "-")
}

/// Durable writer for one run's `RunLog`: owns the in-memory log and
/// flushes it to `<project>/.sequant/logs/` (and optionally a user-level
/// mirror) on `finalize`.
pub struct RunLogWriter {
    log_dir: PathBuf,
    user_mirror_dir: Option<PathBuf>,
    rotation: RotationConfig,
    log: RunLog,
}

impl RunLogWriter {
    pub fn initialize(
        log_dir: PathBuf,
        user_mirror_dir: Option<PathBuf>,
        rotation: RotationConfig,
        config: RunLogConfig,
    ) -> Self {
        Self {
            log_dir,
            user_mirror_dir,
            rotation,
            log: RunLog::new(config),
        }
    }

    pub fn run_id(&self) -> uuid::Uuid {
        self.log.run_id
    }

    pub fn start_issue(&mut self, iid: u64, title: impl Into<String>, labels: Vec<String>) {
        self.log.start_issue(iid, title, labels);
    }

    pub fn log_phase(&mut self, entry: PhaseLog) {
        self.log.log_phase(entry);
    }

    pub fn complete_issue(&mut self) {
        self.log.complete_issue();
    }

    /// Mark the in-flight issue (if any) failed with `reason` — used by the
    /// Shutdown Manager's signal handler so a crash-killed run still leaves
    /// an accurate record (spec §7).
    pub fn mark_in_flight_failed(&mut self, reason: &str) {
        self.log.mark_in_flight_failed(reason);
    }

    /// Finalize the run, write it to disk, and trigger rotation. Returns
    /// the computed summary and the path the log was written to.
    pub fn finalize(&mut self) -> Result<(RunLogSummary, PathBuf)> {
        let summary = self.log.finalize();
        let filename = format!(
            "run-{}-{}.json",
            safe_timestamp(self.log.start_time),
            self.log.run_id
        );

        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("creating run log directory {:?}", self.log_dir))?;
        let path = self.log_dir.join(&filename);
        let json = serde_json::to_string_pretty(&self.log).context("serializing run log")?;
        std::fs::write(&path, &json).with_context(|| format!("writing run log {path:?}"))?;

        if let Some(mirror_dir) = &self.user_mirror_dir {
            std::fs::create_dir_all(mirror_dir).ok();
            std::fs::write(mirror_dir.join(&filename), &json).ok();
        }

        rotate(&self.log_dir, &self.rotation, false)?;
        if let Some(mirror_dir) = &self.user_mirror_dir {
            rotate(mirror_dir, &self.rotation, false).ok();
        }

        Ok((summary, path))
    }
}

/// Load every `RunLog` under `log_dir`, newest-first by start time. Used by
/// `StateStore::rebuild_from_logs`.
pub fn load_all_newest_first(log_dir: &Path) -> Result<Vec<RunLog>> {
    let mut logs: Vec<RunLog> = Vec::new();
    if !log_dir.exists() {
        return Ok(logs);
    }
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading run log {path:?}"))?;
        match serde_json::from_str::<RunLog>(&content) {
            Ok(log) => logs.push(log),
            Err(_) => continue,
        }
    }
    logs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogPhaseStatus, Phase};
    use chrono::Utc;

    fn config() -> RunLogConfig {
        RunLogConfig {
            phases: vec![Phase::Exec, Phase::Qa],
            sequential: false,
            quality_loop: false,
            max_iterations: 1,
            base_branch: "main".into(),
            dry_run: false,
        }
    }

    fn phase_log(issue: u64, status: LogPhaseStatus) -> PhaseLog {
        PhaseLog {
            phase: Phase::Exec,
            issue_number: issue,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_seconds: 1.0,
            status,
            error: None,
            iterations: None,
            files_modified: None,
            file_diff_stats: None,
            commit_hash: None,
            cache_metrics: None,
            verdict: None,
        }
    }

    #[test]
    fn finalize_writes_one_json_file_with_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            RunLogWriter::initialize(dir.path().to_path_buf(), None, RotationConfig::default(), config());
        writer.start_issue(1, "fix thing", vec!["bug".into()]);
        writer.log_phase(phase_log(1, LogPhaseStatus::Success));
        let (summary, path) = writer.finalize().unwrap();
        assert_eq!(summary.total_issues, 1);
        assert_eq!(summary.passed, 1);
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("run-"));
    }

    #[test]
    fn rotation_trims_to_90_percent_of_file_count_threshold() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let path = dir.path().join(format!("run-x-{i}.json"));
            std::fs::write(&path, "{}").unwrap();
            // ensure distinct mtimes for deterministic oldest-first ordering
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let cfg = RotationConfig {
            enabled: true,
            max_size_mb: 1000.0,
            max_files: 10,
        };
        let report = rotate(dir.path(), &cfg, false).unwrap();
        assert!(!report.deleted.is_empty());
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(remaining <= 9);
    }

    #[test]
    fn rotation_is_noop_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run-a.json"), "{}").unwrap();
        let cfg = RotationConfig::default();
        let report = rotate(dir.path(), &cfg, false).unwrap();
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn dry_run_rotation_reports_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            std::fs::write(dir.path().join(format!("run-{i}.json")), "{}").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let cfg = RotationConfig {
            enabled: true,
            max_size_mb: 1000.0,
            max_files: 10,
        };
        let report = rotate(dir.path(), &cfg, true).unwrap();
        assert!(!report.deleted.is_empty());
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 12);
    }

    #[test]
    fn load_all_newest_first_orders_by_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut older = RunLogWriter::initialize(
            dir.path().to_path_buf(),
            None,
            RotationConfig::default(),
            config(),
        );
        older.start_issue(1, "a", vec![]);
        older.log_phase(phase_log(1, LogPhaseStatus::Success));
        older.finalize().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut newer = RunLogWriter::initialize(
            dir.path().to_path_buf(),
            None,
            RotationConfig::default(),
            config(),
        );
        newer.start_issue(2, "b", vec![]);
        newer.log_phase(phase_log(2, LogPhaseStatus::Success));
        newer.finalize().unwrap();

        let logs = load_all_newest_first(dir.path()).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].start_time >= logs[1].start_time);
    }
}
