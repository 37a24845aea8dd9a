//! Hub Manager: lifecycle of the shadow working tree.
//!
//! The hub is a clone of the user repo's remote, living next to the
//! workspace. All agent mutations land here; the user's working tree is never
//! touched before the approval gate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::error::PipelineError;
use crate::io::git::Git;

const SYNC_ATTEMPTS: u32 = 3;

/// Owns the hub working tree; agents mutate it only through the gateway
/// this manager hands out.
#[derive(Debug, Clone)]
pub struct HubManager {
    workspace: PathBuf,
    hub_path: PathBuf,
    remote: String,
    git_log_path: Option<PathBuf>,
}

impl HubManager {
    pub fn new(
        workspace: impl Into<PathBuf>,
        hub_path: impl Into<PathBuf>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            hub_path: hub_path.into(),
            remote: remote.into(),
            git_log_path: None,
        }
    }

    /// One timestamped git log file per run under the given directory.
    pub fn with_git_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
        self.git_log_path = Some(dir.into().join(format!("{stamp}.log")));
        self
    }

    pub fn hub_path(&self) -> &Path {
        &self.hub_path
    }

    /// Gateway scoped to the hub working tree.
    pub fn git(&self) -> Git {
        let git = Git::new(&self.hub_path);
        match &self.git_log_path {
            Some(path) => git.with_log_file(path),
            None => git,
        }
    }

    fn workspace_git(&self) -> Git {
        Git::new(&self.workspace)
    }

    /// Locate or create the hub, then bring `working_branch` level with the
    /// remote. Transient failures retry with exponential backoff.
    #[instrument(skip_all, fields(hub = %self.hub_path.display()))]
    pub fn ensure(&self, working_branch: &str) -> Result<(), PipelineError> {
        if !self.hub_path.exists() {
            let url = self
                .workspace_git()
                .remote_url(&self.remote)
                .map_err(|err| PipelineError::HubUnavailable(format!("no remote url: {err}")))?;
            info!(url = %url, "hub missing, shallow cloning");
            with_retries(SYNC_ATTEMPTS, || Git::clone_shallow(&url, &self.hub_path))
                .map_err(|err| PipelineError::HubUnavailable(format!("clone failed: {err}")))?;
        }

        let git = self.git();
        with_retries(SYNC_ATTEMPTS, || git.fetch(&self.remote))
            .map_err(|err| PipelineError::HubUnavailable(format!("fetch failed: {err}")))?;

        let upstream = format!("{}/{working_branch}", self.remote);
        git.checkout(working_branch)
            .or_else(|_| {
                // Branch may not exist locally yet in a fresh shallow clone.
                git.checkout_new_branch(working_branch)
            })
            .map_err(|err| PipelineError::HubUnavailable(format!("checkout failed: {err}")))?;
        git.reset_hard(&upstream)
            .map_err(|err| PipelineError::HubUnavailable(format!("reset failed: {err}")))?;
        debug!(branch = working_branch, "hub level with upstream");
        Ok(())
    }

    /// Checkout `parent`, then create and checkout `new_branch` from it.
    /// A pre-existing branch means a run id collision and aborts the run.
    pub fn create_agent_branch(
        &self,
        parent: &str,
        new_branch: &str,
    ) -> Result<(), PipelineError> {
        let git = self.git();
        if git.branch_exists(new_branch)? {
            return Err(PipelineError::BranchExists(new_branch.to_string()));
        }
        git.checkout(parent)?;
        git.checkout_new_branch(new_branch)?;
        Ok(())
    }

    /// Apply the user's local patch (upstream tip .. local HEAD) onto the
    /// current hub branch. Returns `false` when there is nothing to apply.
    pub fn apply_user_diff(&self, working_branch: &str) -> Result<bool, PipelineError> {
        let base = format!("{}/{working_branch}", self.remote);
        let patch = self.workspace_git().diff_patch(&base, "HEAD")?;
        if patch.trim().is_empty() {
            debug!("no patch to apply");
            return Ok(false);
        }
        self.git().apply_patch(&patch)?;
        Ok(true)
    }

    /// Hard-reset the hub's checkout to a named branch.
    pub fn reset_to(&self, branch: &str) -> Result<(), PipelineError> {
        let git = self.git();
        if let Err(err) = git.checkout(branch) {
            warn!(branch, "checkout during reset failed: {err}");
        }
        git.reset_hard(branch)
    }

    /// Delete derivative branches; non-existence is not an error. Leaves the
    /// hub parked on `park_on` so no deleted branch is checked out.
    pub fn cleanup(&self, park_on: &str, branches: &[String]) -> Result<Vec<String>, PipelineError> {
        let git = self.git();
        git.checkout(park_on)?;
        let mut deleted = Vec::new();
        for branch in branches {
            if git.branch_exists(branch)? {
                git.delete_branch(branch)?;
                deleted.push(branch.clone());
            }
        }
        Ok(deleted)
    }

    /// Remove the hub directory entirely.
    pub fn destroy(&self) -> Result<(), PipelineError> {
        if self.hub_path.exists() {
            std::fs::remove_dir_all(&self.hub_path)?;
        }
        Ok(())
    }
}

fn with_retries<F>(attempts: u32, mut f: F) -> Result<(), PipelineError>
where
    F: FnMut() -> Result<(), PipelineError>,
{
    let mut delay = Duration::from_millis(500);
    let mut last = None;
    for attempt in 1..=attempts {
        match f() {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(attempt, attempts, "hub operation failed: {err}");
                last = Some(err);
                if attempt < attempts {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        PipelineError::InternalInvariantViolated("retry loop with zero attempts".to_string())
    }))
}
