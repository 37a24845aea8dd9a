//! Git gateway: a thin wrapper around the system `git` binary.
//!
//! Every hub mutation goes through this wrapper so the command log stays
//! complete and failures surface uniformly as `PipelineError::Git`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::core::context::CommitInfo;
use crate::core::error::PipelineError;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Parsed `git diff --shortstat` counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    log_path: Option<PathBuf>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            log_path: None,
        }
    }

    /// Append one line per git invocation to this file.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String, PipelineError> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(PipelineError::Git {
                command: "rev-parse".to_string(),
                detail: "detached HEAD (refuse to run)".to_string(),
            });
        }
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String, PipelineError> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn rev_parse(&self, reference: &str) -> Result<String, PipelineError> {
        let out = self.run_capture(&["rev-parse", reference])?;
        Ok(out.trim().to_string())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, PipelineError> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> Result<(), PipelineError> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<(), PipelineError> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Delete a local branch. Non-existence is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<(), PipelineError> {
        if !self.branch_exists(branch)? {
            return Ok(());
        }
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    pub fn fetch(&self, remote: &str) -> Result<(), PipelineError> {
        self.run_checked(&["fetch", remote])?;
        Ok(())
    }

    /// Fetch a ref directly from another local repository path.
    pub fn fetch_from_path(&self, path: &Path, reference: &str) -> Result<(), PipelineError> {
        let path = path.to_string_lossy().into_owned();
        self.run_checked(&["fetch", &path, reference])?;
        Ok(())
    }

    /// Fast-forward the current branch to the given ref; refuses non-ff.
    pub fn merge_ff_only(&self, reference: &str) -> Result<(), PipelineError> {
        self.run_checked(&["merge", "--ff-only", reference])?;
        Ok(())
    }

    pub fn reset_hard(&self, reference: &str) -> Result<(), PipelineError> {
        self.run_checked(&["reset", "--hard", reference])?;
        Ok(())
    }

    pub fn remote_url(&self, remote: &str) -> Result<String, PipelineError> {
        let out = self.run_capture(&["remote", "get-url", remote])?;
        Ok(out.trim().to_string())
    }

    /// Shallow-clone `url` into `target`. Runs outside any workdir.
    pub fn clone_shallow(url: &str, target: &Path) -> Result<(), PipelineError> {
        let target_str = target.to_string_lossy().into_owned();
        let output = Command::new("git")
            .args(["clone", "--depth", "1", url, &target_str])
            .output()
            .with_context(|| format!("spawn git clone {url}"))
            .map_err(|err| PipelineError::Git {
                command: "clone".to_string(),
                detail: format!("{err:#}"),
            })?;
        if !output.status.success() {
            return Err(PipelineError::Git {
                command: "clone".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>, PipelineError> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<(), PipelineError> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes with a message and return the new HEAD sha.
    /// Always produces a commit, even when the tree is unchanged, so each
    /// agent branch carries its checkpoint.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<String, PipelineError> {
        self.run_checked(&["commit", "--allow-empty", "-m", message])?;
        self.head_sha()
    }

    /// File names changed between two refs, relative to the repo root.
    pub fn diff_name_only(&self, base: &str, head: &str) -> Result<Vec<String>, PipelineError> {
        let range = format!("{base}..{head}");
        let out = self.run_capture(&["diff", "--name-only", &range])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Full patch text between two refs, including binary changes.
    pub fn diff_patch(&self, base: &str, head: &str) -> Result<String, PipelineError> {
        let range = format!("{base}..{head}");
        self.run_capture(&["diff", "--binary", &range])
    }

    pub fn diff_shortstat(&self, base: &str, head: &str) -> Result<DiffStats, PipelineError> {
        let range = format!("{base}..{head}");
        let out = self.run_capture(&["diff", "--shortstat", &range])?;
        Ok(parse_shortstat(&out))
    }

    /// Apply a patch to the working tree and index. On rejection the stderr
    /// (listing the failed hunks) is surfaced as `PatchConflict`.
    pub fn apply_patch(&self, patch: &str) -> Result<(), PipelineError> {
        use std::process::Stdio;

        let mut child = Command::new("git")
            .args(["apply", "--index", "--whitespace=nowarn", "-"])
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn git apply")
            .map_err(|err| PipelineError::Git {
                command: "apply".to_string(),
                detail: format!("{err:#}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(patch.as_bytes())
                .context("write patch to git apply")
                .map_err(|err| PipelineError::Git {
                    command: "apply".to_string(),
                    detail: format!("{err:#}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .context("wait git apply")
            .map_err(|err| PipelineError::Git {
                command: "apply".to_string(),
                detail: format!("{err:#}"),
            })?;
        self.log_invocation(&["apply", "--index", "-"], output.status.code());
        if !output.status.success() {
            return Err(PipelineError::PatchConflict {
                rejected: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    pub fn push(&self, remote: &str, branch: &str) -> Result<(), PipelineError> {
        self.run_checked(&["push", remote, branch])?;
        Ok(())
    }

    /// Commits in `base..HEAD`, oldest first.
    pub fn commits_since(&self, base: &str) -> Result<Vec<CommitInfo>, PipelineError> {
        let range = format!("{base}..HEAD");
        let out = self.run_capture(&[
            "log",
            "--reverse",
            "--pretty=format:%H%x1f%an <%ae>%x1f%aI%x1f%s",
            &range,
        ])?;
        let mut commits = Vec::new();
        for line in out.lines() {
            let mut fields = line.split('\u{1f}');
            let (Some(sha), Some(author), Some(timestamp), Some(message)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            commits.push(CommitInfo {
                sha: sha.to_string(),
                message: message.to_string(),
                author: author.to_string(),
                timestamp: timestamp.to_string(),
            });
        }
        Ok(commits)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String, PipelineError> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output, PipelineError> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Git {
                command: args.join(" "),
                detail: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output, PipelineError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
            .map_err(|err| PipelineError::Git {
                command: args.join(" "),
                detail: format!("{err:#}"),
            })?;
        self.log_invocation(args, output.status.code());
        Ok(output)
    }

    fn log_invocation(&self, args: &[&str], exit_code: Option<i32>) {
        let Some(path) = &self.log_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(
                file,
                "[{}] git {} -> {:?}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                args.join(" "),
                exit_code
            );
        }
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry, PipelineError> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(PipelineError::Git {
            command: "status".to_string(),
            detail: format!("unexpected porcelain line: '{line}'"),
        });
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_shortstat(out: &str) -> DiffStats {
    // "3 files changed, 120 insertions(+), 45 deletions(-)"
    let mut stats = DiffStats::default();
    for part in out.trim().split(',') {
        let part = part.trim();
        let Some(number) = part.split_whitespace().next().and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if part.contains("file") {
            stats.files_changed = number;
        } else if part.contains("insertion") {
            stats.additions = number;
        } else if part.contains("deletion") {
            stats.deletions = number;
        }
    }
    stats
}
