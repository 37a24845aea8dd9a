//! Sync agent: the single approval gate.
//!
//! On approval the user's working branch is fast-forwarded to the refactor
//! tip, pushed to the remote, and the hub's derivative branches are deleted.
//! On decline the hub stays on the refactor branch for manual inspection and
//! the pipeline continues to the non-blocking agents.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use crate::agents::{Agent, AgentLog, PipelineEnv};
use crate::approval::ApprovalSummary;
use crate::core::context::RunContext;
use crate::core::error::PipelineError;
use crate::io::git::Git;
use crate::io::state::load_agent_cache;

const PUSH_ATTEMPTS: u32 = 3;

pub struct SyncAgent;

impl Agent for SyncAgent {
    fn name(&self) -> &'static str {
        "sync_agent"
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        env: &PipelineEnv,
        log: &mut AgentLog,
    ) -> Result<serde_json::Value> {
        // The refactor tip is the publish candidate; when Refactor failed
        // before creating its branch the test tip is the last good layer.
        let tip_branch = ctx
            .refactor_branch
            .clone()
            .or_else(|| ctx.test_branch.clone())
            .ok_or_else(|| PipelineError::InternalInvariantViolated("no branch to sync".into()))?;

        let summary = self.build_summary(ctx, env, &tip_branch)?;
        log.info(&summary.render());

        let manual_push = format!(
            "git push {} {}",
            ctx.remote_name, ctx.working_branch
        );

        let approved = env.approval.ask(&summary)?;
        ctx.approved = Some(approved);
        if !approved {
            // Hub stays on the refactor branch; nothing is deleted.
            log.info("user declined the push, hub left for inspection");
            log.info(&format!("manual push: {manual_push}"));
            return Ok(json!({
                "approved": false,
                "pushed": false,
                "manual_push": manual_push,
            }));
        }

        // Advance the workspace working branch to the refactor tip. The hub
        // rebuilt the user's commits on the upstream tip, so when the literal
        // fast-forward is impossible the branch adopts the hub history; the
        // tree content already contains everything the user committed.
        let workspace_git = Git::new(&ctx.workspace_path);
        let dirty: Vec<String> = workspace_git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.code != "??")
            .map(|entry| entry.path)
            .collect();
        if !dirty.is_empty() {
            return Err(PipelineError::InternalInvariantViolated(format!(
                "workspace has uncommitted changes, refusing to advance: {dirty:?}"
            ))
            .into());
        }
        workspace_git.fetch_from_path(&ctx.hub_path, &tip_branch)?;
        if workspace_git.merge_ff_only("FETCH_HEAD").is_err() {
            workspace_git.reset_hard("FETCH_HEAD")?;
        }
        let pushed_sha = workspace_git.head_sha()?;
        log.info(&format!("workspace advanced to {pushed_sha}"));

        // Push with bounded retries; exhaustion is blocking and leaves the
        // hub untouched.
        let mut last_error = String::new();
        let mut pushed = false;
        for attempt in 1..=PUSH_ATTEMPTS {
            match workspace_git.push(&ctx.remote_name, &ctx.working_branch) {
                Ok(()) => {
                    pushed = true;
                    break;
                }
                Err(err) => {
                    warn!(attempt, "push failed: {err}");
                    log.warn(&format!("push attempt {attempt}/{PUSH_ATTEMPTS} failed: {err}"));
                    last_error = err.to_string();
                    if attempt < PUSH_ATTEMPTS {
                        std::thread::sleep(Duration::from_millis(500 * attempt as u64));
                    }
                }
            }
        }
        if !pushed {
            return Err(PipelineError::PushFailed {
                attempts: PUSH_ATTEMPTS,
                detail: format!("{last_error}; push manually with `{manual_push}`"),
            }
            .into());
        }
        log.info(&format!(
            "pushed {} to {}/{}",
            pushed_sha, ctx.remote_name, ctx.working_branch
        ));

        // Delete all four derivative branches from the hub.
        let branches = ctx.all_agent_branches();
        let deleted = env.hub.cleanup(&ctx.working_branch, &branches)?;
        log.info(&format!("{} hub branch(es) deleted", deleted.len()));

        Ok(json!({
            "approved": true,
            "pushed": true,
            "pushed_sha": pushed_sha,
            "remote_branch": format!("{}/{}", ctx.remote_name, ctx.working_branch),
            "branches_deleted": deleted,
        }))
    }
}

impl SyncAgent {
    fn build_summary(
        &self,
        ctx: &RunContext,
        env: &PipelineEnv,
        tip_branch: &str,
    ) -> Result<ApprovalSummary> {
        let base = format!("{}/{}", ctx.remote_name, ctx.working_branch);
        let stats = env.hub.git().diff_shortstat(&base, tip_branch)?;

        let commit_message = ctx
            .user_commit_message
            .clone()
            .or_else(|| ctx.user_commits.first().map(|c| c.message.clone()))
            .unwrap_or_else(|| "commitly: apply changes".to_string());

        // Highlights from the earlier agents' caches; absence is fine.
        let optimized = load_agent_cache(&env.paths, "test_agent")
            .ok()
            .and_then(|cache| {
                cache.data["optimizer"]["summary"]["improved"]
                    .as_u64()
                    .map(|n| n as usize)
            })
            .unwrap_or(0);
        let refactored = load_agent_cache(&env.paths, "refactor_agent")
            .ok()
            .and_then(|cache| cache.data["refactored"].as_array().map(Vec::len))
            .unwrap_or(0);

        Ok(ApprovalSummary {
            commit_message,
            files_changed: stats.files_changed,
            additions: stats.additions,
            deletions: stats.deletions,
            query_sites: ctx.embedded_query_sites.len(),
            optimized_queries: optimized,
            refactored_files: refactored,
            push_target: format!("{}/{}", ctx.remote_name, ctx.working_branch),
        })
    }
}
