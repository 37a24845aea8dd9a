//! Code agent: syntactic and runtime validation, plus query mining.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::agents::{run_in_hub, Agent, AgentLog, PipelineEnv};
use crate::core::context::RunContext;
use crate::core::error::PipelineError;
use crate::io::process::{run_command, ExecSpec};
use crate::sql::extract::extract_sites;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STATIC_CHECK_TIMEOUT: Duration = Duration::from_secs(120);

pub struct CodeAgent;

impl Agent for CodeAgent {
    fn name(&self) -> &'static str {
        "code_agent"
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        env: &PipelineEnv,
        log: &mut AgentLog,
    ) -> Result<serde_json::Value> {
        let parent = ctx
            .clone_branch
            .clone()
            .ok_or_else(|| PipelineError::InternalInvariantViolated("no clone branch".into()))?;
        let branch = ctx.branch_name(self.name());
        env.hub.create_agent_branch(&parent, &branch)?;
        ctx.set_agent_branch(self.name(), branch.clone());

        // Environment check: the interpreter must exist and answer.
        let mut probe = ExecSpec::new(&ctx.interpreter, &ctx.hub_path);
        probe.args = vec!["--version".to_string()];
        probe.envs = env.env_overlay.clone();
        probe.timeout = VERSION_PROBE_TIMEOUT;
        let interpreter_version = match run_command(&probe) {
            Ok(output) if output.success() => {
                let version = format!("{}{}", output.stdout_lossy(), output.stderr_lossy())
                    .trim()
                    .to_string();
                log.info(&format!("interpreter: {version}"));
                version
            }
            Ok(output) => {
                return Err(PipelineError::EnvironmentBlocked(format!(
                    "{} --version exited with {:?}",
                    ctx.interpreter,
                    output.exit_code()
                ))
                .into());
            }
            Err(err) => {
                return Err(PipelineError::EnvironmentBlocked(format!(
                    "interpreter {} not runnable: {err:#}",
                    ctx.interpreter
                ))
                .into());
            }
        };

        // Static analysis: each configured check is soft. A missing tool is a
        // skip with a warning, a failing check is recorded but not fatal.
        let mut static_results = Vec::new();
        for check in &env.config.execution.static_checks {
            let result = match run_in_hub(env, &ctx.hub_path, check, STATIC_CHECK_TIMEOUT, log) {
                Ok(output) if output.success() => json!({
                    "command": check, "status": "passed",
                }),
                Ok(output) => {
                    log.warn(&format!("static check failed (soft): {check}"));
                    json!({
                        "command": check,
                        "status": "failed",
                        "exit_code": output.exit_code(),
                    })
                }
                Err(err) => {
                    log.warn(&format!("static check unavailable, skipping: {check} ({err:#})"));
                    json!({ "command": check, "status": "skipped" })
                }
            };
            static_results.push(result);
        }

        // Dynamic execution of the primary command.
        let timeout = Duration::from_secs(env.config.execution.timeout);
        let command = &env.config.execution.command;
        let execution = run_in_hub(env, &ctx.hub_path, command, timeout, log)?;
        if execution.timed_out {
            return Err(PipelineError::RuntimeFailed {
                exit_code: None,
                detail: format!("'{command}' timed out after {}s", timeout.as_secs()),
            }
            .into());
        }
        if !execution.status.success() {
            return Err(PipelineError::RuntimeFailed {
                exit_code: execution.exit_code(),
                detail: truncate(&execution.combined_log(), 4000),
            }
            .into());
        }
        log.info(&format!(
            "primary command succeeded in {}ms",
            execution.duration_ms
        ));

        // Query extraction over the changed files.
        let dialect = env
            .config
            .database
            .as_ref()
            .map(|db| db.dialect.clone())
            .unwrap_or_else(|| "postgresql".to_string());
        let sites = extract_sites(&ctx.changed_files, &env.config.sql.keywords, &dialect)?;
        ctx.has_embedded_queries = !sites.is_empty();
        ctx.embedded_query_sites = sites;
        log.info(&format!(
            "{} embedded query site(s) found",
            ctx.embedded_query_sites.len()
        ));

        let git = env.hub.git();
        git.add_all()?;
        git.commit("commitly: validate code")?;

        Ok(json!({
            "interpreter_version": interpreter_version,
            "static_checks": static_results,
            "execution": {
                "exit_code": execution.exit_code(),
                "duration_ms": execution.duration_ms,
            },
            "has_embedded_queries": ctx.has_embedded_queries,
            "embedded_query_sites": ctx.embedded_query_sites,
        }))
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..cut], text.len() - cut)
}
