//! Agent contract and the base wrapper.
//!
//! Agents are invoked only through [`run_agent`], which stamps start/end
//! times, opens the per-agent log sink, captures any failure as a structured
//! error record, caches the output, and updates the run context outcome map.
//! Failure is a return value; nothing crosses the agent boundary as a panic.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::approval::Approval;
use crate::chat::ChatNotifier;
use crate::core::argv::split_command;
use crate::core::config::Config;
use crate::core::context::{AgentRecord, AgentStatus, ErrorRecord, RunContext};
use crate::core::error::kind_of;
use crate::core::paths::CommitlyPaths;
use crate::db::PlanProbe;
use crate::io::hub::HubManager;
use crate::io::process::{run_command, CommandOutput, ExecSpec};
use crate::io::state::{write_agent_cache, write_run_context, AgentCache};
use crate::llm::LlmHandle;

pub mod clone;
pub mod code;
pub mod notify;
pub mod refactor;
pub mod report;
pub mod sync;

/// Collaborators and configuration shared by all agents in a run.
pub struct PipelineEnv {
    pub config: Config,
    pub paths: CommitlyPaths,
    pub hub: HubManager,
    /// `.env` contents plus the interpreter-dir PATH prefix, layered over the
    /// process environment for every hub subprocess.
    pub env_overlay: Vec<(String, String)>,
    pub llm: Option<Box<dyn LlmHandle>>,
    pub probe: Option<Box<dyn PlanProbe>>,
    pub approval: Box<dyn Approval>,
    pub notifier: Option<Box<dyn ChatNotifier>>,
}

/// A pipeline agent: a name and one execution over the shared context.
pub trait Agent {
    fn name(&self) -> &'static str;

    /// Blocking agents abort the pipeline on failure; non-blocking failures
    /// are recorded and the pipeline continues.
    fn blocking(&self) -> bool {
        true
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        env: &PipelineEnv,
        log: &mut AgentLog,
    ) -> Result<serde_json::Value>;
}

/// Per-agent product log sink at `.commitly/logs/<agent>/<timestamp>.log`.
pub struct AgentLog {
    path: PathBuf,
    file: File,
}

impl AgentLog {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
        let path = dir.join(format!("{stamp}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&mut self, message: &str) {
        self.write_line("INFO", message);
    }

    pub fn warn(&mut self, message: &str) {
        self.write_line("WARN", message);
    }

    pub fn error(&mut self, message: &str) {
        self.write_line("ERROR", message);
    }

    /// Record a subprocess invocation with its captured output.
    pub fn log_command(&mut self, command_line: &str, output: &CommandOutput) {
        self.write_line(
            "CMD",
            &format!(
                "{command_line} -> exit {:?} in {}ms",
                output.exit_code(),
                output.duration_ms
            ),
        );
        let _ = writeln!(self.file, "{}", output.combined_log());
    }

    fn write_line(&mut self, level: &str, message: &str) {
        let _ = writeln!(
            self.file,
            "[{}] {level} - {message}",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Execute one agent through the base wrapper and return its record.
pub fn run_agent(agent: &dyn Agent, ctx: &mut RunContext, env: &PipelineEnv) -> AgentRecord {
    let name = agent.name();
    let started_at = Utc::now();
    let timer = Instant::now();
    info!(agent = name, "agent starting");

    {
        let record = ctx.record_for(name);
        record.status = AgentStatus::Running;
        record.started_at = Some(started_at);
    }

    let mut log = match AgentLog::open(&env.paths.agent_log_dir(name)) {
        Ok(log) => log,
        Err(err) => {
            // No log sink: the agent cannot run under the contract.
            let record = fail_record(ctx, name, started_at, timer, None, &err);
            persist(ctx, env, name, &record, serde_json::json!({}));
            return record;
        }
    };

    let result = agent.execute(ctx, env, &mut log);
    let ended_at = Utc::now();
    let duration_ms = timer.elapsed().as_millis() as u64;

    let (record, data) = match result {
        Ok(data) => {
            log.info(&format!("{name} completed in {duration_ms}ms"));
            let record = AgentRecord {
                status: AgentStatus::Succeeded,
                started_at: Some(started_at),
                ended_at: Some(ended_at),
                duration_ms: Some(duration_ms),
                branch: ctx.agent_branch(name).map(str::to_string),
                log_path: Some(log.path().to_path_buf()),
                error: None,
            };
            (record, data)
        }
        Err(err) => {
            log.error(&format!("{name} failed: {err:#}"));
            warn!(agent = name, "agent failed: {err:#}");
            let record = fail_record(
                ctx,
                name,
                started_at,
                timer,
                Some(log.path().to_path_buf()),
                &err,
            );
            (record, serde_json::json!({}))
        }
    };

    persist(ctx, env, name, &record, data);
    record
}

fn fail_record(
    ctx: &mut RunContext,
    name: &str,
    started_at: chrono::DateTime<Utc>,
    timer: Instant,
    log_path: Option<PathBuf>,
    err: &anyhow::Error,
) -> AgentRecord {
    let cause = err.chain().nth(1).map(|c| c.to_string());
    AgentRecord {
        status: AgentStatus::Failed,
        started_at: Some(started_at),
        ended_at: Some(Utc::now()),
        duration_ms: Some(timer.elapsed().as_millis() as u64),
        branch: ctx.agent_branch(name).map(str::to_string),
        log_path: log_path.clone(),
        error: Some(ErrorRecord {
            kind: kind_of(err).to_string(),
            message: format!("{err:#}"),
            cause,
            log_path,
        }),
    }
}

fn persist(
    ctx: &mut RunContext,
    env: &PipelineEnv,
    name: &str,
    record: &AgentRecord,
    data: serde_json::Value,
) {
    *ctx.record_for(name) = record.clone();

    let cache = AgentCache {
        run_id: ctx.run_id.clone(),
        agent_name: name.to_string(),
        branch: record.branch.clone(),
        status: record.status,
        started_at: record.started_at.unwrap_or_else(Utc::now),
        ended_at: record.ended_at.unwrap_or_else(Utc::now),
        duration_ms: record.duration_ms.unwrap_or(0),
        data,
    };
    if let Err(err) = write_agent_cache(&env.paths, &cache) {
        warn!(agent = name, "cache write failed: {err:#}");
    }
    if let Err(err) = write_run_context(&env.paths, ctx) {
        warn!(agent = name, "run context write failed: {err:#}");
    }
}

/// Run a configured command string inside the hub with the run's environment
/// overlay, logging the invocation to the agent's sink.
pub fn run_in_hub(
    env: &PipelineEnv,
    hub_path: &Path,
    command: &str,
    timeout: Duration,
    log: &mut AgentLog,
) -> Result<CommandOutput> {
    let words = split_command(command)?;
    let mut spec = ExecSpec::new(&words[0], hub_path);
    spec.args = words[1..].to_vec();
    spec.envs = env.env_overlay.clone();
    spec.timeout = timeout;

    let output = run_command(&spec)?;
    log.log_command(command, &output);
    Ok(output)
}
