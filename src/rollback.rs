//! Rollback engine: rewind the hub after a blocking failure.
//!
//! Never retries the failed agent. Recovery is user-initiated via a fresh
//! commit.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::agents::PipelineEnv;
use crate::core::context::{ErrorRecord, RunContext, RunStatus};
use crate::io::state::{write_json_atomic, write_run_context};

/// Rewind the hub to the last successful agent branch, delete derivative
/// branches from the failing agent onward, persist the error record to both
/// log roots, and mark the run failed.
pub fn rollback_and_cleanup(
    ctx: &mut RunContext,
    env: &PipelineEnv,
    failed_agent: &str,
    error: &ErrorRecord,
) -> Result<()> {
    info!(agent = failed_agent, "rollback engine triggered");

    let last_branch = ctx.last_successful_branch(failed_agent);
    let doomed = ctx.branches_from(failed_agent);

    if ctx.hub_path.exists() {
        if let Err(err) = env.hub.reset_to(&last_branch) {
            warn!("hub reset to {last_branch} failed: {err}");
        } else {
            info!(branch = %last_branch, "hub rewound");
        }
        match env.hub.cleanup(&last_branch, &doomed) {
            Ok(deleted) => info!(count = deleted.len(), "derivative branches deleted"),
            Err(err) => warn!("branch cleanup failed: {err}"),
        }
    }

    persist_error_records(ctx, failed_agent, error, &last_branch);

    if env.config.pipeline.cleanup_hub_on_failure {
        match env.hub.destroy() {
            Ok(()) => info!("hub directory removed"),
            Err(err) => warn!("hub removal failed: {err}"),
        }
    }

    ctx.status = Some(RunStatus::Failed);
    ctx.error = Some(error.clone());
    ctx.ended_at = Some(Utc::now());
    write_run_context(&env.paths, ctx)?;
    Ok(())
}

/// The error artifact goes to both the hub's log directory and the local one,
/// so it survives either tree being cleaned.
fn persist_error_records(
    ctx: &RunContext,
    failed_agent: &str,
    error: &ErrorRecord,
    rollback_branch: &str,
) {
    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
    let record = json!({
        "run_id": ctx.run_id,
        "failed_agent": failed_agent,
        "error": error,
        "rollback_branch": rollback_branch,
        "timestamp": stamp,
    });

    let local = ctx
        .workspace_path
        .join(".commitly")
        .join("logs")
        .join(failed_agent)
        .join(format!("error_{stamp}.log"));
    if let Err(err) = write_json_atomic(&local, &record) {
        warn!("local error record write failed: {err:#}");
    }

    if ctx.hub_path.exists() {
        let hub = ctx
            .hub_path
            .join("logs")
            .join(failed_agent)
            .join(format!("error_{stamp}.log"));
        if let Err(err) = write_json_atomic(&hub, &record) {
            warn!("hub error record write failed: {err:#}");
        }
    }
}
