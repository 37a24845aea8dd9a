//! Error kinds surfaced across the agent boundary.
//!
//! Agents return these as values; the agent base converts them into structured
//! error records. Blocking agents' errors trigger the rollback engine, soft
//! kinds abort only the current site or file.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Typed failure conditions of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("another pipeline run holds the lock at {0}")]
    LockHeld(PathBuf),

    #[error("hub unavailable: {0}")]
    HubUnavailable(String),

    #[error("patch does not apply cleanly:\n{rejected}")]
    PatchConflict { rejected: String },

    #[error("branch already exists on the hub: {0} (run id collision)")]
    BranchExists(String),

    #[error("unexpected files in hub status: {0:?}")]
    VerificationMismatch(Vec<String>),

    #[error("environment blocked: {0}")]
    EnvironmentBlocked(String),

    #[error("static check failed: {0}")]
    StaticCheckFailed(String),

    #[error("runtime failed (exit {exit_code:?}): {detail}")]
    RuntimeFailed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("tests failed (exit {exit_code:?}): {detail}")]
    TestFailed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("query parse failed: {0}")]
    QueryParseFailed(String),

    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    #[error("push failed after {attempts} attempt(s): {detail}")]
    PushFailed { attempts: u32, detail: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("git {command} failed: {detail}")]
    Git { command: String, detail: String },

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable kind label recorded in error artifacts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing(_) => "ConfigurationMissing",
            Self::LockHeld(_) => "LockHeld",
            Self::HubUnavailable(_) => "HubUnavailable",
            Self::PatchConflict { .. } => "PatchConflict",
            Self::BranchExists(_) => "BranchExists",
            Self::VerificationMismatch(_) => "VerificationMismatch",
            Self::EnvironmentBlocked(_) => "EnvironmentBlocked",
            Self::StaticCheckFailed(_) => "StaticCheckFailed",
            Self::RuntimeFailed { .. } => "RuntimeFailed",
            Self::TestFailed { .. } => "TestFailed",
            Self::QueryParseFailed(_) => "QueryParseFailed",
            Self::DatabaseUnavailable(_) => "DatabaseUnavailable",
            Self::LlmUnavailable(_) => "LLMUnavailable",
            Self::PushFailed { .. } => "PushFailed",
            Self::Timeout(_) => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Git { .. } => "Git",
            Self::InternalInvariantViolated(_) => "InternalInvariantViolated",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }

    /// Soft kinds abort only the current site/file/check, never the pipeline.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::StaticCheckFailed(_)
                | Self::QueryParseFailed(_)
                | Self::DatabaseUnavailable(_)
                | Self::LlmUnavailable(_)
        )
    }
}

/// Extract the pipeline error kind from an `anyhow` chain, if present.
pub fn kind_of(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::kind)
        .unwrap_or("InternalInvariantViolated")
}
