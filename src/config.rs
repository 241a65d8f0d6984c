//! Layered settings and the resolved `ExecutionConfig` bundle handed to the
//! Scheduler for one `run` invocation.
//!
//! Grounded on `forge_config.rs`'s layering idiom (file → environment → CLI,
//! TOML via `serde` + `toml`) narrowed to the fields the engine itself
//! consumes per spec §3/§6 — the teacher's phase-override glob patterns,
//! review/decomposition sub-configs and permission-mode matrix have no
//! counterpart here and are dropped (see DESIGN.md).

use crate::errors::EngineError;
use crate::model::Phase;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `run.rotation` settings-file section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub enabled: bool,
    pub max_size_mb: f64,
    pub max_files: usize,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 10.0,
            max_files: 100,
        }
    }
}

/// `run.*` settings-file section: every field the engine reads from
/// `sequant.toml`, with defaults matching spec §3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub default_base: String,
    pub log_json: bool,
    pub log_path: Option<PathBuf>,
    pub rotation: RotationSettings,
    pub timeout: u64,
    pub sequential: bool,
    pub quality_loop: bool,
    pub max_iterations: u32,
    pub smart_tests: bool,
    pub auto_detect_phases: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            default_base: "main".to_string(),
            log_json: true,
            log_path: None,
            rotation: RotationSettings::default(),
            timeout: 1800,
            sequential: false,
            quality_loop: false,
            max_iterations: 3,
            smart_tests: true,
            auto_detect_phases: true,
        }
    }
}

/// Project-relative `sequant.toml`. `scope_assessment` is carried through
/// opaquely: the scope-assessment heuristic it configures is an auxiliary
/// utility outside this engine's scope (spec §1), so the engine parses and
/// preserves the field without ever reading it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scope_assessment: Option<toml::Value>,
    pub run: RunSettings,
}

impl Settings {
    /// Load `sequant.toml` from `project_dir`. A missing file or malformed
    /// TOML both fall back silently to defaults (spec §7): the settings
    /// layer is best-effort, unlike the state store.
    pub fn load(project_dir: &Path) -> Self {
        let path = settings_path(project_dir);
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }
}

pub fn sequant_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".sequant")
}

pub fn settings_path(project_dir: &Path) -> PathBuf {
    sequant_dir(project_dir).join("sequant.toml")
}

pub fn state_path(project_dir: &Path) -> PathBuf {
    sequant_dir(project_dir).join("state.json")
}

pub fn log_dir(project_dir: &Path, settings: &RunSettings) -> PathBuf {
    settings
        .log_path
        .clone()
        .unwrap_or_else(|| sequant_dir(project_dir).join("logs"))
}

/// `~/.sequant/logs/`, the optional user-level run log mirror.
pub fn user_log_mirror_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".sequant").join("logs"))
}

/// Everything the CLI layer can override; `None` means "not explicitly
/// passed", so resolution falls through to the next layer. Boolean flags
/// that are off-by-default (`--sequential`, `--chain`, ...) are plain
/// `bool` since clap reports "not present" as `false`, which is
/// indistinguishable from an explicit `--no-sequential` — there is no such
/// negating flag in spec §6, so `false` here is never mistaken for a lower
/// layer's `true`.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub phases: Option<Vec<Phase>>,
    pub phase_timeout: Option<u64>,
    pub sequential: bool,
    pub force_parallel: bool,
    pub chain: bool,
    pub qa_gate: bool,
    pub base_branch: Option<String>,
    pub dry_run: bool,
    pub verbose: bool,
    pub quality_loop: bool,
    pub max_iterations: Option<u32>,
    pub testgen: bool,
    pub no_smart_tests: bool,
    pub no_mcp: bool,
    pub no_retry: bool,
    pub no_rebase: bool,
    pub no_pr: bool,
    pub resume: bool,
    pub force: bool,
}

/// Immutable per-run bundle the Scheduler/Issue Runner consume (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub phases: Vec<Phase>,
    pub phase_timeout: u64,
    pub quality_loop: bool,
    pub max_iterations: u32,
    pub sequential: bool,
    pub force_parallel: bool,
    pub chain: bool,
    pub qa_gate: bool,
    pub skip_verification: bool,
    pub no_smart_tests: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub mcp: bool,
    pub retry: bool,
    pub base_branch: String,
    pub resume: bool,
    pub no_rebase: bool,
    pub no_pr: bool,
    pub force: bool,
    pub auto_detect_phases: bool,
    pub testgen: bool,
    /// Whether `phases` came from an explicit `--phases`/`PHASES` override
    /// rather than the label-adjusted default. The Issue Runner only
    /// re-derives the plan from a `spec` phase's `## Recommended Workflow`
    /// when this is `false` (spec §4.5).
    pub phases_explicit: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            phases: vec![Phase::Spec, Phase::Exec, Phase::Qa],
            phase_timeout: 1800,
            quality_loop: false,
            max_iterations: 3,
            sequential: false,
            force_parallel: false,
            chain: false,
            qa_gate: false,
            skip_verification: false,
            no_smart_tests: false,
            dry_run: false,
            verbose: false,
            mcp: true,
            retry: true,
            base_branch: "main".to_string(),
            resume: false,
            no_rebase: false,
            no_pr: false,
            force: false,
            auto_detect_phases: true,
            testgen: false,
            phases_explicit: false,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn env_phases(name: &str) -> Result<Option<Vec<Phase>>, EngineError> {
    match std::env::var(name) {
        Ok(raw) => parse_phase_list(&raw).map(Some),
        Err(_) => Ok(None),
    }
}

/// Parse a comma-separated phase list, rejecting unknown names at
/// config-resolution time rather than silently skipping them (REDESIGN FLAGS).
pub fn parse_phase_list(raw: &str) -> Result<Vec<Phase>, EngineError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|token| {
            Phase::from_str_loose(token).ok_or_else(|| EngineError::UnknownPhase {
                name: token.to_string(),
            })
        })
        .collect()
}

/// Resolve CLI overrides, environment variables, and the project settings
/// file into one `ExecutionConfig`, in that priority order (spec §6).
pub fn resolve(
    project_dir: &Path,
    cli: &CliOverrides,
    settings: &Settings,
) -> Result<ExecutionConfig, EngineError> {
    let _ = project_dir;
    let defaults = ExecutionConfig::default();
    let run = &settings.run;

    let env_phase_override = env_phases("PHASES")?;
    let phases_explicit = cli.phases.is_some() || env_phase_override.is_some();
    let phases = match &cli.phases {
        Some(p) => p.clone(),
        None => match env_phase_override {
            Some(p) => p,
            None => defaults.phases.clone(),
        },
    };

    let phase_timeout = cli
        .phase_timeout
        .or_else(|| env_u64("PHASE_TIMEOUT"))
        .unwrap_or(run.timeout);

    let quality_loop = cli.quality_loop
        || env_bool("SEQUANT_QUALITY_LOOP").unwrap_or(run.quality_loop);

    let max_iterations = cli
        .max_iterations
        .or_else(|| env_u32("SEQUANT_MAX_ITERATIONS"))
        .unwrap_or(run.max_iterations);

    let no_smart_tests = cli.no_smart_tests || !env_bool("SEQUANT_SMART_TESTS").unwrap_or(run.smart_tests);

    let testgen = cli.testgen || env_bool("SEQUANT_TESTGEN").unwrap_or(false);

    let base_branch = cli
        .base_branch
        .clone()
        .unwrap_or_else(|| run.default_base.clone());

    Ok(ExecutionConfig {
        phases,
        phase_timeout,
        quality_loop,
        max_iterations,
        sequential: cli.sequential || run.sequential,
        force_parallel: cli.force_parallel,
        chain: cli.chain,
        qa_gate: cli.qa_gate,
        skip_verification: defaults.skip_verification,
        no_smart_tests,
        dry_run: cli.dry_run,
        verbose: cli.verbose,
        mcp: !cli.no_mcp,
        retry: !cli.no_retry,
        base_branch,
        resume: cli.resume,
        no_rebase: cli.no_rebase,
        no_pr: cli.no_pr,
        force: cli.force,
        auto_detect_phases: run.auto_detect_phases,
        testgen,
        phases_explicit,
    })
}
