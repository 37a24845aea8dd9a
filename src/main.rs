//! Commitly CLI: post-commit automation for a single local repository.
//!
//! Records the commit, then drives the seven-agent pipeline against an
//! isolated hub replica. Exit codes are stable: 0 success, 1 pipeline failed,
//! 2 declined at the gate, 3 configuration error, 4 lock held.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use commitly::agents::report::render_report_standalone;
use commitly::approval::{Approval, FileApproval, ScriptedApproval};
use commitly::core::config::{load_config, scaffold_yaml};
use commitly::core::context::{RunStatus, AGENT_ORDER};
use commitly::core::error::PipelineError;
use commitly::core::paths::CommitlyPaths;
use commitly::exit_codes;
use commitly::io::git::Git;
use commitly::io::state::load_run_context;
use commitly::logging;
use commitly::pipeline::{Collaborators, Pipeline};

#[derive(Parser)]
#[command(
    name = "commitly",
    version,
    about = "Validate, test, optimize, and publish a commit through an isolated hub"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold `.commitly/` and synthesize a configuration file.
    Init {
        /// Overwrite an existing configuration.
        #[arg(short, long)]
        force: bool,
    },
    /// Record a commit in this repository, then run the pipeline.
    Commit {
        /// Commit message.
        #[arg(short, long)]
        message: String,
        /// Approve the Sync gate without prompting.
        #[arg(long)]
        yes: bool,
        /// Read the Sync gate decision from a file instead of the terminal.
        #[arg(long)]
        approval_file: Option<PathBuf>,
    },
    /// Render a markdown report over a date range.
    Report {
        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        from: NaiveDate,
        /// End date (YYYY-MM-DD).
        #[arg(long)]
        to: NaiveDate,
        /// md, pdf, or html; non-markdown degrades to markdown.
        #[arg(long, default_value = "md")]
        format: String,
    },
    /// Print the last run's summary.
    Status,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workspace = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&workspace, force),
        Command::Commit {
            message,
            yes,
            approval_file,
        } => cmd_commit(&workspace, &message, yes, approval_file),
        Command::Report { from, to, format } => cmd_report(&workspace, from, to, &format),
        Command::Status => cmd_status(&workspace),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::LockHeld(_)) => exit_codes::LOCK_HELD,
        Some(PipelineError::ConfigurationMissing(_)) => exit_codes::CONFIG_ERROR,
        _ => exit_codes::PIPELINE_FAILED,
    }
}

fn cmd_init(workspace: &Path, force: bool) -> Result<i32> {
    let paths = CommitlyPaths::new(workspace);
    if paths.config_path.exists() && !force {
        println!(
            "{} already exists (use --force to overwrite)",
            paths.config_path.display()
        );
        return Ok(exit_codes::CONFIG_ERROR);
    }

    std::fs::create_dir_all(&paths.cache_dir).context("create cache dir")?;
    std::fs::create_dir_all(&paths.logs_dir).context("create logs dir")?;
    std::fs::create_dir_all(&paths.reports_dir).context("create reports dir")?;
    std::fs::write(
        paths.commitly_dir.join(".gitignore"),
        "cache/\nlogs/\nreports/\npipeline.lock\n",
    )
    .context("write state gitignore")?;

    let entrypoint = detect_entrypoint(workspace);
    let python_bin = detect_python_bin(workspace);
    let yaml = scaffold_yaml(
        &format!("python {entrypoint}"),
        "pytest -q",
        python_bin.as_deref(),
    );
    std::fs::write(&paths.config_path, yaml)
        .with_context(|| format!("write {}", paths.config_path.display()))?;

    println!("initialized {}", paths.config_path.display());
    println!("  entrypoint: python {entrypoint}");
    if let Some(bin) = python_bin {
        println!("  interpreter: {bin}");
    }
    Ok(exit_codes::OK)
}

fn cmd_commit(
    workspace: &Path,
    message: &str,
    yes: bool,
    approval_file: Option<PathBuf>,
) -> Result<i32> {
    let paths = CommitlyPaths::new(workspace);
    let config = load_config(&paths.config_path)?;

    // Record the user's commit before the pipeline starts.
    let git = Git::new(workspace);
    git.add_all()?;
    if git.status_porcelain()?.is_empty() {
        // Nothing newly staged is fine; the pipeline no-ops past Clone.
        println!("nothing new to commit, validating current state");
    } else {
        let sha = git.commit(message)?;
        println!("recorded commit {} \"{message}\"", &sha[..8.min(sha.len())]);
    }

    let mut collaborators = Collaborators::from_config(&config, workspace);
    if let Some(path) = approval_file {
        collaborators.approval = Box::new(FileApproval { path }) as Box<dyn Approval>;
    } else if yes {
        collaborators.approval = Box::new(ScriptedApproval(true)) as Box<dyn Approval>;
    }

    let pipeline = Pipeline::prepare(workspace, config, collaborators, Some(message.to_string()))?;
    let outcome = pipeline.run().map_err(anyhow::Error::from)?;

    match outcome.status {
        RunStatus::Succeeded => println!("pipeline succeeded (run {})", outcome.run_id),
        RunStatus::ApprovedNoPush => {
            println!("pipeline finished without push (run {})", outcome.run_id);
            println!("hub left on the refactor branch for inspection");
        }
        RunStatus::Failed | RunStatus::Aborted => {
            let agent = outcome.failed_agent.as_deref().unwrap_or("pipeline");
            println!("pipeline failed at {agent} (run {})", outcome.run_id);
            println!("  logs: {}", paths.agent_log_dir(agent).display());
            println!("  inspect the hub: cd {}", hub_hint(workspace));
        }
    }
    Ok(outcome.exit_code())
}

fn cmd_report(workspace: &Path, from: NaiveDate, to: NaiveDate, format: &str) -> Result<i32> {
    if to < from {
        anyhow::bail!("--to precedes --from");
    }
    let path = render_report_standalone(workspace, from, to, format)?;
    println!("report written: {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_status(workspace: &Path) -> Result<i32> {
    let paths = CommitlyPaths::new(workspace);
    let ctx = match load_run_context(&paths) {
        Ok(ctx) => ctx,
        Err(_) => {
            println!("no pipeline run recorded");
            return Ok(exit_codes::OK);
        }
    };

    let status = ctx
        .status
        .map(|s| format!("{s:?}").to_lowercase())
        .unwrap_or_else(|| "in progress".to_string());
    println!("run {} — {status}", ctx.run_id);
    println!("  branch: {} (remote {})", ctx.working_branch, ctx.remote_name);
    for agent in AGENT_ORDER {
        let Some(record) = ctx.agent_records.get(agent) else {
            continue;
        };
        let duration = record
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "—".to_string());
        println!("  {agent:<16} {:?} ({duration})", record.status);
    }
    if let Some(error) = &ctx.error {
        println!("  error: [{}] {}", error.kind, error.message);
        if let Some(log) = &error.log_path {
            println!("  log: {}", log.display());
        }
    }
    Ok(exit_codes::OK)
}

fn hub_hint(workspace: &Path) -> String {
    commitly::core::paths::hub_path_for(workspace)
        .display()
        .to_string()
}

fn detect_entrypoint(workspace: &Path) -> String {
    for candidate in ["main.py", "app.py", "src/main.py"] {
        if workspace.join(candidate).exists() {
            return candidate.to_string();
        }
    }
    "main.py".to_string()
}

fn detect_python_bin(workspace: &Path) -> Option<String> {
    for candidate in [".venv/bin/python", "venv/bin/python"] {
        if workspace.join(candidate).exists() {
            return Some(candidate.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commit_with_message() {
        let cli = Cli::parse_from(["commitly", "commit", "-m", "fix: thing"]);
        match cli.command {
            Command::Commit { message, yes, .. } => {
                assert_eq!(message, "fix: thing");
                assert!(!yes);
            }
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn parse_report_range() {
        let cli = Cli::parse_from([
            "commitly", "report", "--from", "2026-07-01", "--to", "2026-07-31",
        ]);
        match cli.command {
            Command::Report { from, to, format } => {
                assert_eq!(from.to_string(), "2026-07-01");
                assert_eq!(to.to_string(), "2026-07-31");
                assert_eq!(format, "md");
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn entrypoint_detection_prefers_main_py() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("app.py"), "").expect("write");
        assert_eq!(detect_entrypoint(temp.path()), "app.py");
        std::fs::write(temp.path().join("main.py"), "").expect("write");
        assert_eq!(detect_entrypoint(temp.path()), "main.py");
    }
}
