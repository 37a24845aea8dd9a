//! Single-writer pipeline lock.
//!
//! An exclusive advisory lock on a file under the user repo guarantees at most
//! one pipeline run per repository. The guard releases the lock on every exit
//! path, including unwinding.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;
use tracing::debug;

use crate::core::error::PipelineError;

/// Held for the duration of a pipeline run.
#[derive(Debug)]
pub struct PipelineLock {
    file: File,
    path: PathBuf,
}

impl PipelineLock {
    /// Try to take the exclusive lock. Fails fast with `LockHeld` when another
    /// run is active.
    pub fn acquire(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))
            .map_err(|err| PipelineError::InternalInvariantViolated(format!("{err:#}")))?;

        if file.try_lock_exclusive().is_err() {
            return Err(PipelineError::LockHeld(path.to_path_buf()));
        }
        debug!(path = %path.display(), "pipeline lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        // The OS also releases on process exit; explicit unlock keeps the
        // lock scoped to the guard within one process.
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "pipeline lock released");
    }
}
