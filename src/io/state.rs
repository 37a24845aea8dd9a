//! Persisted run state: agent caches and the run context store.
//!
//! Every artifact is pretty-printed JSON with a trailing newline, written
//! atomically (temp file + rename) so a crash never leaves a torn file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::context::{AgentStatus, RunContext};
use crate::core::paths::CommitlyPaths;

/// One agent's cached output (`.commitly/cache/<agent>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCache {
    pub run_id: String,
    pub agent_name: String,
    pub branch: Option<String>,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub data: serde_json::Value,
}

pub fn write_agent_cache(paths: &CommitlyPaths, cache: &AgentCache) -> Result<()> {
    let path = paths.agent_cache_path(&cache.agent_name);
    write_json_atomic(&path, cache)
}

pub fn load_agent_cache(paths: &CommitlyPaths, agent: &str) -> Result<AgentCache> {
    let path = paths.agent_cache_path(agent);
    load_json(&path)
}

pub fn write_run_context(paths: &CommitlyPaths, ctx: &RunContext) -> Result<()> {
    write_json_atomic(&paths.run_context_path, ctx)
}

pub fn load_run_context(paths: &CommitlyPaths) -> Result<RunContext> {
    load_json(&paths.run_context_path)
}

/// Serialize `value` to pretty-printed JSON with trailing newline, then
/// atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), "wrote json artifact");
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
