//! Database plan probe for the query optimizer.
//!
//! The probe answers two read-only questions: what does a table look like,
//! and what does the planner think a query costs. The production probe wraps
//! the system `psql` binary the same way the git gateway wraps `git`; no DDL
//! ever runs through it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::config::DatabaseConfig;
use crate::core::error::PipelineError;
use crate::io::process::{run_command, ExecSpec};

/// Planner verdict for one query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanMeasure {
    /// Planner total cost of the root plan node.
    pub total_cost: f64,
    /// Actual execution time in milliseconds.
    pub execution_time_ms: f64,
}

/// Read-only access to the optimizer's target database.
pub trait PlanProbe {
    /// Human-readable schema brief for one table: columns, types, indices.
    fn table_brief(&self, table: &str) -> Result<String, PipelineError>;

    /// Run `EXPLAIN (ANALYZE, BUFFERS, COSTS)` for the query and report the
    /// measured plan.
    fn explain(&self, query: &str) -> Result<PlanMeasure, PipelineError>;
}

/// Probe backed by the system `psql` binary.
pub struct PsqlProbe {
    config: DatabaseConfig,
    timeout: Duration,
    workdir: PathBuf,
}

impl PsqlProbe {
    /// Build from config. Only the postgres dialect is measurable; anything
    /// else returns `None` so the optimizer degrades to a no-op.
    pub fn from_config(config: &DatabaseConfig, workdir: &std::path::Path) -> Option<Self> {
        let dialect = config.dialect.to_ascii_lowercase();
        if dialect != "postgresql" && dialect != "postgres" {
            return None;
        }
        if config.dbname.is_empty() {
            return None;
        }
        Some(Self {
            config: config.clone(),
            timeout: Duration::from_secs(60),
            workdir: workdir.to_path_buf(),
        })
    }

    fn run_sql(&self, sql: &str) -> Result<String, PipelineError> {
        let mut spec = ExecSpec::new("psql", &self.workdir);
        spec.args = vec![
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-U".to_string(),
            self.config.user.clone(),
            "-d".to_string(),
            self.config.dbname.clone(),
            "-X".to_string(),
            "-A".to_string(),
            "-t".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-c".to_string(),
            sql.to_string(),
        ];
        spec.envs
            .push(("PGPASSWORD".to_string(), self.config.password.clone()));
        spec.timeout = self.timeout;

        let output = run_command(&spec)
            .map_err(|err| PipelineError::DatabaseUnavailable(format!("{err:#}")))?;
        if output.timed_out {
            return Err(PipelineError::DatabaseUnavailable(format!(
                "psql timed out after {:?}",
                self.timeout
            )));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy().trim().to_string();
            // psql exits 2 when the connection itself fails; 1 is a SQL-level
            // error under ON_ERROR_STOP, which callers treat per-query.
            return if output.exit_code() == Some(2) {
                Err(PipelineError::DatabaseUnavailable(stderr))
            } else {
                Err(PipelineError::QueryParseFailed(stderr))
            };
        }
        Ok(output.stdout_lossy())
    }
}

#[derive(Debug, Deserialize)]
struct ExplainEntry {
    #[serde(rename = "Plan")]
    plan: ExplainPlan,
    #[serde(rename = "Execution Time")]
    execution_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ExplainPlan {
    #[serde(rename = "Total Cost")]
    total_cost: f64,
}

impl PlanProbe for PsqlProbe {
    #[instrument(skip_all, fields(table))]
    fn table_brief(&self, table: &str) -> Result<String, PipelineError> {
        let ident = sanitize_identifier(table)?;
        let columns = self.run_sql(&format!(
            "SELECT column_name || ' ' || data_type FROM information_schema.columns \
             WHERE table_name = '{ident}' ORDER BY ordinal_position"
        ))?;
        let indexes = self.run_sql(&format!(
            "SELECT indexdef FROM pg_indexes WHERE tablename = '{ident}' ORDER BY indexname"
        ))?;
        Ok(format_table_brief(table, &columns, &indexes))
    }

    #[instrument(skip_all)]
    fn explain(&self, query: &str) -> Result<PlanMeasure, PipelineError> {
        let sql = format!("EXPLAIN (ANALYZE, BUFFERS, COSTS, FORMAT JSON) {query}");
        let raw = self.run_sql(&sql)?;
        parse_explain_json(&raw)
    }
}

/// Build the schema brief fed to the language model.
pub fn format_table_brief(table: &str, columns: &str, indexes: &str) -> String {
    let mut brief = format!("TABLE {table} (");
    let cols: Vec<&str> = columns
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    brief.push_str(&cols.join(", "));
    brief.push(')');
    for index in indexes.lines().map(str::trim).filter(|l| !l.is_empty()) {
        brief.push('\n');
        brief.push_str("  ");
        brief.push_str(index);
    }
    brief
}

/// Parse psql's `EXPLAIN (FORMAT JSON)` output.
pub fn parse_explain_json(raw: &str) -> Result<PlanMeasure, PipelineError> {
    let entries: Vec<ExplainEntry> = serde_json::from_str(raw.trim()).map_err(|err| {
        PipelineError::QueryParseFailed(format!("unparsable EXPLAIN output: {err}"))
    })?;
    let entry = entries
        .first()
        .ok_or_else(|| PipelineError::QueryParseFailed("empty EXPLAIN output".to_string()))?;
    let measure = PlanMeasure {
        total_cost: entry.plan.total_cost,
        execution_time_ms: entry.execution_time.unwrap_or(0.0),
    };
    debug!(cost = measure.total_cost, time_ms = measure.execution_time_ms, "plan measured");
    Ok(measure)
}

/// Table names arrive from query text; only plain identifiers may be
/// interpolated into catalog lookups.
fn sanitize_identifier(table: &str) -> Result<String, PipelineError> {
    let trimmed = table.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(PipelineError::QueryParseFailed(format!(
            "suspicious table identifier '{table}'"
        )));
    }
    Ok(trimmed.to_string())
}
