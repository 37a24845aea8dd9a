//! Refactor agent: per-file quality improvements with per-file reverts.
//!
//! Each changed file is rewritten by the language model under a fixed rule
//! set, auto-fixed, and verified by the project tests. A failing file is
//! reverted and skipped; Refactor never blocks Sync on its own errors.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::agents::{run_in_hub, Agent, AgentLog, PipelineEnv};
use crate::core::context::RunContext;
use crate::core::error::PipelineError;
use crate::io::process::{run_command, ExecSpec};

const FIX_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RefactorAgent;

impl Agent for RefactorAgent {
    fn name(&self) -> &'static str {
        "refactor_agent"
    }

    fn blocking(&self) -> bool {
        false
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        env: &PipelineEnv,
        log: &mut AgentLog,
    ) -> Result<serde_json::Value> {
        let parent = ctx
            .test_branch
            .clone()
            .ok_or_else(|| PipelineError::InternalInvariantViolated("no test branch".into()))?;
        let branch = ctx.branch_name(self.name());
        env.hub.create_agent_branch(&parent, &branch)?;
        ctx.set_agent_branch(self.name(), branch.clone());

        let Some(llm) = env.llm.as_ref() else {
            // Degrades to a no-op with an empty change list.
            log.warn("language model unavailable, refactoring skipped");
            return Ok(json!({
                "refactored": [],
                "reverted": [],
                "total_checked": 0,
                "skipped": "language model unavailable",
            }));
        };

        let mut files: Vec<_> = ctx.changed_files.clone();
        files.sort();

        let mut refactored: Vec<String> = Vec::new();
        let mut reverted: Vec<String> = Vec::new();
        let mut checked = 0usize;

        for file in &files {
            if file.extension().and_then(|e| e.to_str()) != Some("py") || !file.exists() {
                continue;
            }
            checked += 1;
            let display = file.display().to_string();
            log.info(&format!("refactoring {display}"));

            let original = std::fs::read_to_string(file)?;
            let suggestion = match llm.suggest_refactoring(
                &original,
                &display,
                &env.config.refactoring.rules,
            ) {
                Ok(code) => code,
                Err(err) => {
                    log.warn(&format!("suggestion failed, file skipped: {err}"));
                    continue;
                }
            };

            if suggestion.trim().is_empty() || suggestion == original.trim_end() {
                log.info("no change suggested");
                continue;
            }

            let mut updated = suggestion;
            if !updated.ends_with('\n') {
                updated.push('\n');
            }
            std::fs::write(file, &updated)?;

            self.run_fixer(env, &ctx.hub_path, file, log);

            let tests = run_in_hub(
                env,
                &ctx.hub_path,
                &env.config.test.command,
                Duration::from_secs(env.config.test.timeout),
                log,
            )?;
            if tests.success() {
                refactored.push(display);
            } else {
                // Revert just this file and continue with the rest.
                log.warn(&format!("tests failed, reverting {display}"));
                std::fs::write(file, &original)?;
                reverted.push(display);
            }
        }

        if !refactored.is_empty() {
            let git = env.hub.git();
            git.add_all()?;
            git.commit("commitly: refactor changed files")?;
            log.info(&format!("{} file(s) refactored", refactored.len()));
        } else {
            log.info("nothing refactored, commit skipped");
        }

        Ok(json!({
            "refactored": refactored,
            "reverted": reverted,
            "total_checked": checked,
        }))
    }
}

impl RefactorAgent {
    /// Formatter + auto-fixer over one file. Missing tool is a skip.
    fn run_fixer(&self, env: &PipelineEnv, hub_path: &Path, file: &Path, log: &mut AgentLog) {
        let fix_command = &env.config.refactoring.fix_command;
        if fix_command.is_empty() {
            return;
        }
        let mut spec = ExecSpec::new(&fix_command[0], hub_path);
        spec.args = fix_command[1..].to_vec();
        spec.args.push(file.display().to_string());
        spec.envs = env.env_overlay.clone();
        spec.timeout = FIX_TIMEOUT;

        match run_command(&spec) {
            Ok(output) => log.log_command(&spec.command_line(), &output),
            Err(err) => log.warn(&format!("fixer unavailable, skipping: {err:#}")),
        }
    }
}
