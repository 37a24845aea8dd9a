//! Pipeline orchestrator: the fixed linear schedule over the seven agents.
//!
//! Clone → Code → Test → Refactor → Sync → Notify → Report. No agent starts
//! before the previous one has returned and its outcome is persisted. A
//! blocking failure hands control to the rollback engine; non-blocking
//! failures are recorded and the terminal status is not downgraded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{
    clone::CloneAgent, code::CodeAgent, notify::NotifyAgent, refactor::RefactorAgent,
    report::ReportAgent, run_agent, sync::SyncAgent, test::TestAgent, Agent, PipelineEnv,
};
use crate::approval::{Approval, InteractiveApproval};
use crate::chat::ChatNotifier;
use crate::core::config::Config;
use crate::core::context::{AgentStatus, RunContext, RunStatus};
use crate::core::error::PipelineError;
use crate::core::lock::PipelineLock;
use crate::core::paths::{hub_path_for, project_name, CommitlyPaths};
use crate::db::{PlanProbe, PsqlProbe};
use crate::exit_codes;
use crate::io::env_file::{apply_database_url_defaults, parse_env_file};
use crate::io::git::Git;
use crate::io::hub::HubManager;
use crate::io::state::write_run_context;
use crate::llm::{CommandLlm, LlmHandle};
use crate::rollback::rollback_and_cleanup;

/// Pluggable collaborators injected into a run.
pub struct Collaborators {
    pub approval: Box<dyn Approval>,
    pub llm: Option<Box<dyn LlmHandle>>,
    pub probe: Option<Box<dyn PlanProbe>>,
    pub notifier: Option<Box<dyn ChatNotifier>>,
}

impl Collaborators {
    /// Production wiring from configuration: interactive approval, the
    /// command-backed model client, and the psql probe when configured.
    pub fn from_config(config: &Config, workspace: &Path) -> Self {
        let llm = CommandLlm::from_config(&config.llm, workspace)
            .map(|client| Box::new(client) as Box<dyn LlmHandle>);
        let probe = config
            .database
            .as_ref()
            .and_then(|db| PsqlProbe::from_config(db, workspace))
            .map(|probe| Box::new(probe) as Box<dyn PlanProbe>);
        Self {
            approval: Box::new(InteractiveApproval),
            llm,
            probe,
            notifier: None,
        }
    }
}

/// Terminal result of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub failed_agent: Option<String>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => exit_codes::OK,
            RunStatus::ApprovedNoPush => exit_codes::DECLINED,
            RunStatus::Failed | RunStatus::Aborted => exit_codes::PIPELINE_FAILED,
        }
    }
}

pub struct Pipeline {
    env: PipelineEnv,
    ctx: RunContext,
}

impl Pipeline {
    /// Build the run context and environment for a fresh run. The commit(s)
    /// must already be recorded in the workspace.
    pub fn prepare(
        workspace: &Path,
        mut config: Config,
        collaborators: Collaborators,
        user_message: Option<String>,
    ) -> Result<Self> {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("resolve workspace {}", workspace.display()))?;
        let paths = CommitlyPaths::new(&workspace);
        let hub_path = hub_path_for(&workspace);
        let project = project_name(&workspace);

        let workspace_git = Git::new(&workspace);
        let working_branch = workspace_git.current_branch()?;
        let base = format!("{}/{working_branch}", config.git.remote);
        let user_commits = workspace_git.commits_since(&base).unwrap_or_else(|err| {
            warn!("commit listing against {base} failed: {err}");
            Vec::new()
        });

        // `.env` joins the subprocess environment and can complete the
        // optimizer's connection settings.
        let env_file = workspace.join(".env");
        let (env_file_path, env_vars) = if env_file.exists() {
            match parse_env_file(&env_file) {
                Ok(vars) => (Some(env_file.clone()), vars),
                Err(err) => {
                    warn!(".env unreadable, ignoring: {err:#}");
                    (None, BTreeMap::new())
                }
            }
        } else {
            (None, BTreeMap::new())
        };
        if let Some(db) = config.database.as_mut() {
            apply_database_url_defaults(&env_vars, db);
        }

        let interpreter = resolve_interpreter(&config, &workspace);
        let mut env_overlay: Vec<(String, String)> =
            env_vars.into_iter().collect();
        if let Some(dir) = Path::new(&interpreter).parent().filter(|d| !d.as_os_str().is_empty()) {
            let path_value = match std::env::var("PATH") {
                Ok(existing) => format!("{}:{existing}", dir.display()),
                Err(_) => dir.display().to_string(),
            };
            env_overlay.push(("PATH".to_string(), path_value));
        }

        // Run artifacts must never dirty the user's tree.
        ensure_state_gitignore(&paths)?;

        let hub = HubManager::new(&workspace, &hub_path, &config.git.remote)
            .with_git_log_dir(&paths.git_log_dir);

        let ctx = RunContext {
            run_id: Uuid::new_v4().to_string(),
            project_name: project,
            workspace_path: workspace.clone(),
            hub_path,
            env_file_path,
            remote_name: config.git.remote.clone(),
            working_branch,
            user_commits,
            user_commit_message: user_message,
            clone_branch: None,
            code_branch: None,
            test_branch: None,
            refactor_branch: None,
            changed_files: Vec::new(),
            has_embedded_queries: false,
            embedded_query_sites: Vec::new(),
            interpreter,
            started_at: Utc::now(),
            ended_at: None,
            status: None,
            approved: None,
            rollback_anchor: None,
            error: None,
            agent_records: BTreeMap::new(),
        };

        Ok(Self {
            env: PipelineEnv {
                config,
                paths,
                hub,
                env_overlay,
                llm: collaborators.llm,
                probe: collaborators.probe,
                approval: collaborators.approval,
                notifier: collaborators.notifier,
            },
            ctx,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run the pipeline to its terminal status. The repository lock is held
    /// for the whole run and released on every exit path.
    pub fn run(mut self) -> Result<RunOutcome, PipelineError> {
        let _lock = PipelineLock::acquire(&self.env.paths.lock_path)?;
        info!(run_id = %self.ctx.run_id, "pipeline starting");
        write_run_context(&self.env.paths, &self.ctx)
            .map_err(|err| PipelineError::InternalInvariantViolated(format!("{err:#}")))?;

        let agents: Vec<Box<dyn Agent>> = vec![
            Box::new(CloneAgent),
            Box::new(CodeAgent),
            Box::new(TestAgent),
            Box::new(RefactorAgent),
            Box::new(SyncAgent),
            Box::new(NotifyAgent),
            Box::new(ReportAgent),
        ];

        for agent in &agents {
            let record = run_agent(agent.as_ref(), &mut self.ctx, &self.env);
            if record.status != AgentStatus::Failed {
                continue;
            }
            if !agent.blocking() {
                warn!(agent = agent.name(), "non-blocking agent failed, continuing");
                continue;
            }

            let error = record.error.clone().unwrap_or_else(|| {
                crate::core::context::ErrorRecord {
                    kind: "InternalInvariantViolated".to_string(),
                    message: "agent failed without an error record".to_string(),
                    cause: None,
                    log_path: None,
                }
            });
            if let Err(err) =
                rollback_and_cleanup(&mut self.ctx, &self.env, agent.name(), &error)
            {
                warn!("rollback incomplete: {err:#}");
            }
            let status = if error.kind == "Cancelled" {
                RunStatus::Aborted
            } else {
                RunStatus::Failed
            };
            self.ctx.status = Some(status);
            let _ = write_run_context(&self.env.paths, &self.ctx);
            return Ok(RunOutcome {
                run_id: self.ctx.run_id.clone(),
                status,
                failed_agent: Some(agent.name().to_string()),
            });
        }

        let status = if self.ctx.approved == Some(false) {
            RunStatus::ApprovedNoPush
        } else {
            RunStatus::Succeeded
        };
        self.ctx.status = Some(status);
        self.ctx.ended_at = Some(Utc::now());
        write_run_context(&self.env.paths, &self.ctx)
            .map_err(|err| PipelineError::InternalInvariantViolated(format!("{err:#}")))?;

        info!(run_id = %self.ctx.run_id, status = ?status, "pipeline finished");
        Ok(RunOutcome {
            run_id: self.ctx.run_id.clone(),
            status,
            failed_agent: None,
        })
    }
}

const STATE_GITIGNORE: &str = "cache/\nlogs/\nreports/\npipeline.lock\n";

fn ensure_state_gitignore(paths: &CommitlyPaths) -> Result<()> {
    let path = paths.commitly_dir.join(".gitignore");
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&paths.commitly_dir)
        .with_context(|| format!("create {}", paths.commitly_dir.display()))?;
    std::fs::write(&path, STATE_GITIGNORE).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Interpreter resolution: config, then `COMMITLY_VENV`, then plain `python`.
fn resolve_interpreter(config: &Config, workspace: &Path) -> String {
    if let Some(bin) = &config.execution.python_bin {
        let candidate = if Path::new(bin).is_absolute() {
            PathBuf::from(bin)
        } else {
            workspace.join(bin)
        };
        if candidate.exists() {
            return candidate.display().to_string();
        }
        warn!(bin = %bin, "configured python_bin missing, falling back");
    }
    if let Ok(venv) = std::env::var("COMMITLY_VENV") {
        let candidate = Path::new(&venv).join("bin").join("python");
        if candidate.exists() {
            return candidate.display().to_string();
        }
    }
    "python".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_from_terminal_status() {
        let outcome = |status| RunOutcome {
            run_id: "r".to_string(),
            status,
            failed_agent: None,
        };
        assert_eq!(outcome(RunStatus::Succeeded).exit_code(), 0);
        assert_eq!(outcome(RunStatus::ApprovedNoPush).exit_code(), 2);
        assert_eq!(outcome(RunStatus::Failed).exit_code(), 1);
        assert_eq!(outcome(RunStatus::Aborted).exit_code(), 1);
    }

    #[test]
    fn interpreter_falls_back_to_python() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = Config::default();
        std::env::remove_var("COMMITLY_VENV");
        assert_eq!(resolve_interpreter(&config, temp.path()), "python");
    }

    #[test]
    fn interpreter_prefers_existing_configured_binary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bin_dir = temp.path().join(".venv/bin");
        std::fs::create_dir_all(&bin_dir).expect("mkdir");
        let bin = bin_dir.join("python");
        std::fs::write(&bin, "#!/bin/sh\n").expect("write");

        let mut config = Config::default();
        config.execution.python_bin = Some(".venv/bin/python".to_string());
        let resolved = resolve_interpreter(&config, temp.path());
        assert!(resolved.ends_with(".venv/bin/python"));
    }
}
