//! Report agent: render a run summary document from the agent caches.
//!
//! Non-blocking. Formats other than markdown degrade to markdown with a
//! warning.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use minijinja::{context, Environment};
use serde_json::json;

use crate::agents::{Agent, AgentLog, PipelineEnv};
use crate::core::context::{RunContext, AGENT_ORDER};
use crate::core::paths::CommitlyPaths;
use crate::io::state::load_agent_cache;

const REPORT_TEMPLATE: &str = include_str!("report_template.md.j2");

pub struct ReportAgent;

impl Agent for ReportAgent {
    fn name(&self) -> &'static str {
        "report_agent"
    }

    fn blocking(&self) -> bool {
        false
    }

    fn execute(
        &self,
        ctx: &mut RunContext,
        env: &PipelineEnv,
        log: &mut AgentLog,
    ) -> Result<serde_json::Value> {
        let today = Utc::now().date_naive();
        let format = env.config.report.format.clone();
        let slug = slugify(
            ctx.user_commit_message
                .as_deref()
                .or_else(|| ctx.user_commits.first().map(|c| c.message.as_str()))
                .unwrap_or("run"),
        );

        let path = render_report(&env.paths, today, today, &format, &slug, log)?;
        log.info(&format!("report written to {}", path.display()));

        Ok(json!({
            "report_path": path,
            "format": "md",
            "period": { "from": today, "to": today },
        }))
    }
}

/// Render agent caches whose runs ended within `[from, to]` into a markdown
/// document under `.commitly/reports/`. Returns the written path.
pub fn render_report(
    paths: &CommitlyPaths,
    from: NaiveDate,
    to: NaiveDate,
    format: &str,
    slug: &str,
    log: &mut AgentLog,
) -> Result<PathBuf> {
    if format != "md" {
        // PDF/HTML renderers are external collaborators; markdown always works.
        log.warn(&format!("format '{format}' not available, writing markdown"));
    }

    let mut agents = Vec::new();
    for name in AGENT_ORDER {
        let Ok(cache) = load_agent_cache(paths, name) else {
            continue;
        };
        let ended = cache.ended_at.date_naive();
        if ended < from || ended > to {
            continue;
        }
        agents.push(context! {
            name => name,
            status => format!("{:?}", cache.status).to_lowercase(),
            branch => cache.branch,
            duration_ms => cache.duration_ms,
            data => cache.data,
        });
    }

    let mut env = Environment::new();
    env.add_template("report", REPORT_TEMPLATE)
        .context("parse report template")?;
    let template = env.get_template("report")?;
    let rendered = template
        .render(context! {
            from => from.to_string(),
            to => to.to_string(),
            generated_at => Utc::now().to_rfc3339(),
            agents => agents,
        })
        .context("render report")?;

    std::fs::create_dir_all(&paths.reports_dir)
        .with_context(|| format!("create {}", paths.reports_dir.display()))?;
    let path = paths
        .reports_dir
        .join(format!("{}-{slug}.md", to.format("%Y-%m-%d")));
    std::fs::write(&path, rendered).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Filesystem-safe slug from a commit message.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars().take(48) {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if (c == ' ' || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug
    }
}

/// Report path helper used by `commitly report` outside a pipeline run.
pub fn render_report_standalone(
    workspace: &Path,
    from: NaiveDate,
    to: NaiveDate,
    format: &str,
) -> Result<PathBuf> {
    let paths = CommitlyPaths::new(workspace);
    let mut log = AgentLog::open(&paths.agent_log_dir("report_agent"))?;
    render_report(&paths, from, to, format, "period", &mut log)
}
