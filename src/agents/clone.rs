//! Clone agent: an isolated snapshot of the user's just-committed state.

use anyhow::Result;
use serde_json::json;

use crate::agents::{Agent, AgentLog, PipelineEnv};
use crate::core::context::RunContext;
use crate::core::error::PipelineError;

pub struct CloneAgent;

impl Agent for CloneAgent {
    fn name(&self) -> &'static str {
        "clone_agent"
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        env: &PipelineEnv,
        log: &mut AgentLog,
    ) -> Result<serde_json::Value> {
        let hub = &env.hub;

        // Locate or create the hub, level with the upstream tip.
        hub.ensure(&ctx.working_branch)?;
        log.info(&format!("hub ready at {}", ctx.hub_path.display()));

        // Derivative branch from the upstream tip of the working branch.
        let branch = ctx.branch_name(self.name());
        hub.create_agent_branch(&ctx.working_branch, &branch)?;
        ctx.set_agent_branch(self.name(), branch.clone());
        log.info(&format!("created {branch}"));

        // Anchor before any mutation, for rollback.
        let anchor = hub.git().head_sha()?;
        ctx.rollback_anchor = Some(anchor.clone());

        // Changed files from the workspace diff against the upstream tip.
        let workspace_git = crate::io::git::Git::new(&ctx.workspace_path);
        let base = format!("{}/{}", ctx.remote_name, ctx.working_branch);
        let relative_files = workspace_git.diff_name_only(&base, "HEAD")?;
        ctx.changed_files = relative_files
            .iter()
            .map(|rel| ctx.hub_path.join(rel))
            .collect();
        log.info(&format!("{} file(s) changed upstream..HEAD", relative_files.len()));

        // Apply the user's patch onto the hub branch.
        let applied = hub.apply_user_diff(&ctx.working_branch)?;
        if !applied {
            log.info("no patch to apply (workspace level with upstream)");
        }

        // Verify only the expected files moved.
        let status = hub.git().status_porcelain()?;
        let unexpected: Vec<String> = status
            .iter()
            .map(|entry| entry.path.clone())
            .filter(|path| !relative_files.iter().any(|rel| rel == path))
            .collect();
        if !unexpected.is_empty() {
            return Err(PipelineError::VerificationMismatch(unexpected).into());
        }

        // Checkpoint the applied state.
        let git = hub.git();
        git.add_all()?;
        let head = git.commit("commitly: apply user commits")?;
        log.info(&format!("hub checkpoint {head}"));

        Ok(json!({
            "hub_head_sha": head,
            "rollback_anchor": anchor,
            "applied_commits": ctx.user_commits.iter().map(|c| c.sha.clone()).collect::<Vec<_>>(),
            "changed_files": ctx.changed_files,
            "patch_applied": applied,
        }))
    }
}
