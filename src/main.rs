//! `sequant` CLI entry point.
//!
//! Mirrors the teacher's `main.rs` `Cli`/`Commands` shape (global flags on
//! the parser, one `Commands` variant per subcommand, dispatch in `main`)
//! narrowed to the engine's six subcommands (spec §6): `run`, `status`,
//! `cleanup-orphans`, `rotate-logs`, `rebuild-state`, `discover`. Everything
//! past argument parsing is delegated to `cmd::{run,status,maintenance}` so
//! this file stays a thin dispatcher, same division of labor as the
//! teacher's `main.rs` / `cmd/*.rs` split.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sequant::cmd::{maintenance, run, status};
use sequant::renderer;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sequant")]
#[command(version, about = "Issue-driven workflow orchestrator")]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one or more issues through the phase pipeline.
    Run {
        /// Issue numbers/ranges, e.g. "12,15-18,21".
        issues: Vec<String>,

        #[arg(long)]
        phases: Option<String>,

        #[arg(long)]
        sequential: bool,

        #[arg(long)]
        force_parallel: bool,

        #[arg(long)]
        chain: bool,

        #[arg(long)]
        qa_gate: bool,

        #[arg(long)]
        base: Option<String>,

        #[arg(long)]
        dry_run: bool,

        #[arg(short, long)]
        verbose: bool,

        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        quality_loop: bool,

        #[arg(long)]
        max_iterations: Option<u32>,

        #[arg(long)]
        testgen: bool,

        /// Repeatable: one group of comma-separated issue numbers per flag.
        #[arg(long = "batch")]
        batch: Vec<String>,

        #[arg(long)]
        no_smart_tests: bool,

        #[arg(long)]
        no_mcp: bool,

        #[arg(long)]
        no_retry: bool,

        #[arg(long)]
        no_rebase: bool,

        #[arg(long)]
        no_pr: bool,

        #[arg(long)]
        resume: bool,

        #[arg(long)]
        force: bool,
    },
    /// Summarize tracked issue state.
    Status,
    /// Remove or flag stale state-store entries whose worktree is gone.
    CleanupOrphans {
        /// Age threshold in hours for merged/abandoned entries (default 7 days).
        hours: Option<u64>,

        #[arg(long)]
        dry_run: bool,
    },
    /// Apply run log rotation (size/count) outside of a `run` invocation.
    RotateLogs {
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild the state store from the newest occurrence of each issue
    /// across all run logs.
    RebuildState,
    /// List worktrees matching `feature/<IID>-*` that the state store
    /// doesn't know about.
    Discover,
}

#[tokio::main]
async fn main() {
    let exit_code = match run_cli().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sequant=info".into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

async fn run_cli() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let renderer = renderer::auto();

    let exit_code = match cli.command {
        Commands::Run {
            issues,
            phases,
            sequential,
            force_parallel,
            chain,
            qa_gate,
            base,
            dry_run,
            verbose,
            timeout,
            quality_loop,
            max_iterations,
            testgen,
            batch,
            no_smart_tests,
            no_mcp,
            no_retry,
            no_rebase,
            no_pr,
            resume,
            force,
        } => {
            let args = run::RunArgs {
                issues,
                phases,
                sequential,
                force_parallel,
                chain,
                qa_gate,
                base,
                dry_run,
                timeout,
                quality_loop,
                max_iterations,
                testgen,
                batch,
                no_smart_tests,
                no_mcp,
                no_retry,
                no_rebase,
                no_pr,
                resume,
                force,
                verbose,
            };
            run::execute(project_dir, args, renderer.as_ref()).await?
        }
        Commands::Status => status::execute(project_dir, renderer.as_ref())?,
        Commands::CleanupOrphans { hours, dry_run } => {
            maintenance::cleanup_orphans(project_dir, hours, dry_run, renderer.as_ref())?
        }
        Commands::RotateLogs { dry_run } => {
            maintenance::rotate_logs(project_dir, dry_run, renderer.as_ref())?
        }
        Commands::RebuildState => maintenance::rebuild_state(project_dir, renderer.as_ref())?,
        Commands::Discover => maintenance::discover(project_dir, renderer.as_ref()).await?,
    };

    Ok(exit_code)
}
