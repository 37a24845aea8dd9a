//! Run context: the typed shared state threaded through the pipeline.
//!
//! A single serializable record owned by the orchestrator. Agents read and
//! mutate it only through the agent base, which persists it to
//! `.commitly/cache/run_context.json` after every agent returns so partial
//! runs stay inspectable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A commit introduced by the just-recorded user action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: String,
}

/// A located SQL literal inside a source file.
///
/// `line_start`/`line_end` are 1-based and inclusive; the literal's text sits
/// within that slice at the moment of discovery. Replacement preserves the
/// indentation prefix of `line_start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuerySite {
    pub file_path: PathBuf,
    /// Enclosing function or method, or `"module"` at top level.
    pub symbol: String,
    pub line_start: usize,
    pub line_end: usize,
    pub original_text: String,
    pub dialect: String,
    pub referenced_tables: Vec<String>,
}

/// Outcome of a single agent within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Blocked,
}

/// Structured failure captured at the agent boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Per-agent bookkeeping stored in the outcome map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRecord {
    pub status: AgentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub branch: Option<String>,
    pub log_path: Option<PathBuf>,
    pub error: Option<ErrorRecord>,
}

impl AgentRecord {
    pub fn pending() -> Self {
        Self {
            status: AgentStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            branch: None,
            log_path: None,
            error: None,
        }
    }
}

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    ApprovedNoPush,
    Aborted,
}

/// The shared state of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    // Identity.
    pub run_id: String,
    pub project_name: String,

    // Paths.
    pub workspace_path: PathBuf,
    pub hub_path: PathBuf,
    pub env_file_path: Option<PathBuf>,

    // Version control.
    pub remote_name: String,
    pub working_branch: String,
    pub user_commits: Vec<CommitInfo>,
    pub user_commit_message: Option<String>,
    pub clone_branch: Option<String>,
    pub code_branch: Option<String>,
    pub test_branch: Option<String>,
    pub refactor_branch: Option<String>,

    // Change set.
    pub changed_files: Vec<PathBuf>,
    pub has_embedded_queries: bool,
    pub embedded_query_sites: Vec<QuerySite>,

    // Execution profile.
    pub interpreter: String,

    // Run state.
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub approved: Option<bool>,
    pub rollback_anchor: Option<String>,
    pub error: Option<ErrorRecord>,
    pub agent_records: BTreeMap<String, AgentRecord>,
}

/// Fixed dispatch order of the seven agents.
pub const AGENT_ORDER: [&str; 7] = [
    "clone_agent",
    "code_agent",
    "test_agent",
    "refactor_agent",
    "sync_agent",
    "notify_agent",
    "report_agent",
];

/// The four branch-creating agents, in layering order.
pub const BRANCH_AGENTS: [&str; 4] = ["clone_agent", "code_agent", "test_agent", "refactor_agent"];

impl RunContext {
    pub fn branch_name(&self, agent: &str) -> String {
        let short = agent.trim_end_matches("_agent");
        format!("commitly/{short}/{}", self.run_id)
    }

    pub fn agent_branch(&self, agent: &str) -> Option<&str> {
        match agent {
            "clone_agent" => self.clone_branch.as_deref(),
            "code_agent" => self.code_branch.as_deref(),
            "test_agent" => self.test_branch.as_deref(),
            "refactor_agent" => self.refactor_branch.as_deref(),
            _ => None,
        }
    }

    pub fn set_agent_branch(&mut self, agent: &str, branch: String) {
        match agent {
            "clone_agent" => self.clone_branch = Some(branch),
            "code_agent" => self.code_branch = Some(branch),
            "test_agent" => self.test_branch = Some(branch),
            "refactor_agent" => self.refactor_branch = Some(branch),
            _ => {}
        }
    }

    /// Branch of the last agent that succeeded before `failed_agent`, falling
    /// back to the user's working branch. Used as the rollback target.
    pub fn last_successful_branch(&self, failed_agent: &str) -> String {
        let mut last: Option<&str> = None;
        for agent in BRANCH_AGENTS {
            if agent == failed_agent {
                break;
            }
            if let Some(branch) = self.agent_branch(agent) {
                last = Some(branch);
            }
        }
        last.unwrap_or(&self.working_branch).to_string()
    }

    /// Branches created by or after `failed_agent`, in layering order.
    pub fn branches_from(&self, failed_agent: &str) -> Vec<String> {
        let mut collecting = false;
        let mut branches = Vec::new();
        for agent in BRANCH_AGENTS {
            if agent == failed_agent {
                collecting = true;
            }
            if collecting {
                if let Some(branch) = self.agent_branch(agent) {
                    branches.push(branch.to_string());
                }
            }
        }
        // A failure in a non-branching agent (sync onward) still removes
        // nothing here; cleanup is sync's own responsibility on success.
        branches
    }

    /// All derivative branches currently recorded, in layering order.
    pub fn all_agent_branches(&self) -> Vec<String> {
        BRANCH_AGENTS
            .iter()
            .filter_map(|agent| self.agent_branch(agent).map(str::to_string))
            .collect()
    }

    pub fn record_for(&mut self, agent: &str) -> &mut AgentRecord {
        self.agent_records
            .entry(agent.to_string())
            .or_insert_with(AgentRecord::pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        RunContext {
            run_id: "r1".to_string(),
            project_name: "proj".to_string(),
            workspace_path: PathBuf::from("/work/proj"),
            hub_path: PathBuf::from("/work/.commitly_hub_proj"),
            env_file_path: None,
            remote_name: "origin".to_string(),
            working_branch: "main".to_string(),
            user_commits: Vec::new(),
            user_commit_message: None,
            clone_branch: None,
            code_branch: None,
            test_branch: None,
            refactor_branch: None,
            changed_files: Vec::new(),
            has_embedded_queries: false,
            embedded_query_sites: Vec::new(),
            interpreter: "python".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: None,
            approved: None,
            rollback_anchor: None,
            error: None,
            agent_records: BTreeMap::new(),
        }
    }

    #[test]
    fn branch_names_follow_the_run_scheme() {
        let ctx = context();
        assert_eq!(ctx.branch_name("clone_agent"), "commitly/clone/r1");
        assert_eq!(ctx.branch_name("refactor_agent"), "commitly/refactor/r1");
    }

    #[test]
    fn rollback_target_is_last_branch_before_failure() {
        let mut ctx = context();
        ctx.clone_branch = Some("commitly/clone/r1".to_string());
        ctx.code_branch = Some("commitly/code/r1".to_string());

        assert_eq!(ctx.last_successful_branch("test_agent"), "commitly/code/r1");
        assert_eq!(ctx.last_successful_branch("clone_agent"), "main");
        assert_eq!(
            ctx.branches_from("code_agent"),
            vec!["commitly/code/r1".to_string()]
        );
    }

    #[test]
    fn context_round_trips_through_json() {
        let mut ctx = context();
        ctx.embedded_query_sites.push(QuerySite {
            file_path: PathBuf::from("/hub/app/repo.py"),
            symbol: "load_users".to_string(),
            line_start: 25,
            line_end: 25,
            original_text: "SELECT * FROM users".to_string(),
            dialect: "postgresql".to_string(),
            referenced_tables: vec!["users".to_string()],
        });
        ctx.record_for("clone_agent").status = AgentStatus::Succeeded;

        let json = serde_json::to_string_pretty(&ctx).expect("serialize");
        let back: RunContext = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.run_id, ctx.run_id);
        assert_eq!(back.embedded_query_sites, ctx.embedded_query_sites);
        assert_eq!(
            back.agent_records.get("clone_agent").map(|r| r.status),
            Some(AgentStatus::Succeeded)
        );
    }
}
