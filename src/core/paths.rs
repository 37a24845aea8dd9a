//! Canonical filesystem layout for commitly state and the hub.

use std::path::{Path, PathBuf};

/// All canonical paths under `<workspace>/.commitly/`.
#[derive(Debug, Clone)]
pub struct CommitlyPaths {
    pub workspace: PathBuf,
    pub commitly_dir: PathBuf,
    pub config_path: PathBuf,
    pub cache_dir: PathBuf,
    pub run_context_path: PathBuf,
    pub logs_dir: PathBuf,
    pub git_log_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub lock_path: PathBuf,
}

impl CommitlyPaths {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let commitly_dir = workspace.join(".commitly");
        let cache_dir = commitly_dir.join("cache");
        let logs_dir = commitly_dir.join("logs");
        Self {
            workspace: workspace.clone(),
            commitly_dir: commitly_dir.clone(),
            config_path: commitly_dir.join("config.yaml"),
            run_context_path: cache_dir.join("run_context.json"),
            cache_dir,
            git_log_dir: logs_dir.join("git"),
            logs_dir,
            reports_dir: commitly_dir.join("reports"),
            lock_path: commitly_dir.join("pipeline.lock"),
        }
    }

    /// Cache file holding the given agent's latest output.
    pub fn agent_cache_path(&self, agent: &str) -> PathBuf {
        self.cache_dir.join(format!("{agent}.json"))
    }

    /// Log directory for the given agent.
    pub fn agent_log_dir(&self, agent: &str) -> PathBuf {
        self.logs_dir.join(agent)
    }
}

/// Hub location: a sibling of the user repository named after the project.
///
/// `<parent(user_repo)>/.commitly_hub_<repo_name>`
pub fn hub_path_for(workspace: &Path) -> PathBuf {
    let name = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let parent = workspace.parent().unwrap_or(workspace);
    parent.join(format!(".commitly_hub_{name}"))
}

/// Project name derived from the workspace directory name.
pub fn project_name(workspace: &Path) -> String {
    workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string())
}
