//! The SQL optimization subloop.
//!
//! For each discovered site: harvest the schema, ask the language model for
//! exactly three functionally-identical candidates, measure everything with
//! EXPLAIN, pick the cheapest plan, and splice the winner back into the
//! source file. Site-level problems skip the site; only a connection-level or
//! model-level outage degrades the whole subloop.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::context::QuerySite;
use crate::core::error::PipelineError;
use crate::db::{PlanMeasure, PlanProbe};
use crate::llm::LlmHandle;

/// Number of alternative queries requested per site.
pub const CANDIDATE_COUNT: usize = 3;

/// Per-site record persisted to the test agent's cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteReport {
    pub file_path: String,
    pub symbol: String,
    pub line_start: usize,
    pub line_end: usize,
    pub original_query: String,
    pub chosen_query: Option<String>,
    pub original_cost: Option<f64>,
    pub chosen_cost: Option<f64>,
    pub original_time_ms: Option<f64>,
    pub chosen_time_ms: Option<f64>,
    /// `(original_cost - chosen_cost) / max(original_cost, 1) * 100`.
    pub improvement_rate: f64,
    pub outcome: SiteOutcome,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SiteOutcome {
    /// A cheaper candidate replaced the original text.
    Rewritten,
    /// No candidate beat the original plan; file untouched.
    NoImprovement,
    /// The model produced no usable candidate list.
    SkippedNoCandidates,
    /// The original query itself would not plan.
    SkippedBaseline,
    /// The file changed under the recorded span.
    SkippedStaleSpan,
}

/// What the subloop decided for one site.
#[derive(Debug, Clone)]
pub struct Decision {
    /// `Some` only when the site should be rewritten.
    pub chosen_query: Option<String>,
    pub report: SiteReport,
}

pub fn improvement_rate(original_cost: f64, chosen_cost: f64) -> f64 {
    (original_cost - chosen_cost) / original_cost.max(1.0) * 100.0
}

/// Run measurement and selection for one site. Site-level failures come back
/// as skip outcomes; `Err` is reserved for outages (`LLMUnavailable`,
/// `DatabaseUnavailable`) that should stop the whole subloop.
#[instrument(skip_all, fields(file = %site.file_path.display(), line = site.line_start))]
pub fn optimize_site(
    site: &QuerySite,
    llm: &dyn LlmHandle,
    probe: &dyn PlanProbe,
) -> Result<Decision, PipelineError> {
    let query = site.original_text.trim();
    let mut report = SiteReport {
        file_path: site.file_path.display().to_string(),
        symbol: site.symbol.clone(),
        line_start: site.line_start,
        line_end: site.line_end,
        original_query: query.to_string(),
        chosen_query: None,
        original_cost: None,
        chosen_cost: None,
        original_time_ms: None,
        chosen_time_ms: None,
        improvement_rate: 0.0,
        outcome: SiteOutcome::NoImprovement,
        candidates: Vec::new(),
    };

    // Schema harvest. An unreadable table still leaves a usable brief.
    let mut brief_parts = Vec::new();
    for table in &site.referenced_tables {
        match probe.table_brief(table) {
            Ok(brief) => brief_parts.push(brief),
            Err(err @ PipelineError::DatabaseUnavailable(_)) => return Err(err),
            Err(err) => {
                warn!(table, "schema lookup failed: {err}");
                brief_parts.push(format!("-- schema for {table} unavailable"));
            }
        }
    }
    let schema_brief = brief_parts.join("\n");

    // Candidate generation. A malformed response means no candidates.
    let candidates =
        match llm.suggest_queries(&schema_brief, query, &site.dialect, CANDIDATE_COUNT) {
            Ok(candidates) => candidates,
            Err(err @ PipelineError::LlmUnavailable(_)) | Err(err @ PipelineError::Timeout(_)) => {
                return Err(err)
            }
            Err(err) => {
                warn!("candidate generation failed: {err}");
                report.outcome = SiteOutcome::SkippedNoCandidates;
                return Ok(Decision {
                    chosen_query: None,
                    report,
                });
            }
        };
    report.candidates = candidates.clone();

    // Baseline measurement. A query that will not plan discards the site.
    let baseline = match probe.explain(query) {
        Ok(measure) => measure,
        Err(err @ PipelineError::DatabaseUnavailable(_)) => return Err(err),
        Err(err) => {
            warn!("baseline EXPLAIN failed: {err}");
            report.outcome = SiteOutcome::SkippedBaseline;
            return Ok(Decision {
                chosen_query: None,
                report,
            });
        }
    };
    report.original_cost = Some(baseline.total_cost);
    report.original_time_ms = Some(baseline.execution_time_ms);

    // Candidate evaluation. Unplannable candidates are discarded.
    let mut measured: Vec<(usize, &String, PlanMeasure)> = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        match probe.explain(candidate) {
            Ok(measure) => measured.push((index, candidate, measure)),
            Err(err @ PipelineError::DatabaseUnavailable(_)) => return Err(err),
            Err(err) => debug!(index, "candidate discarded: {err}"),
        }
    }

    // Selection: minimum total cost, then minimum runtime, then stable order.
    let best = measured.into_iter().min_by(|a, b| {
        a.2.total_cost
            .total_cmp(&b.2.total_cost)
            .then(a.2.execution_time_ms.total_cmp(&b.2.execution_time_ms))
            .then(a.0.cmp(&b.0))
    });

    let Some((_, chosen, measure)) = best else {
        report.outcome = SiteOutcome::SkippedNoCandidates;
        return Ok(Decision {
            chosen_query: None,
            report,
        });
    };

    if measure.total_cost >= baseline.total_cost {
        report.outcome = SiteOutcome::NoImprovement;
        report.chosen_cost = Some(measure.total_cost);
        report.chosen_time_ms = Some(measure.execution_time_ms);
        return Ok(Decision {
            chosen_query: None,
            report,
        });
    }

    report.outcome = SiteOutcome::Rewritten;
    report.chosen_query = Some(chosen.clone());
    report.chosen_cost = Some(measure.total_cost);
    report.chosen_time_ms = Some(measure.execution_time_ms);
    report.improvement_rate = improvement_rate(baseline.total_cost, measure.total_cost);

    Ok(Decision {
        chosen_query: Some(chosen.clone()),
        report,
    })
}

/// A completed in-place replacement.
#[derive(Debug)]
pub struct AppliedSplice {
    /// Full pre-replacement file content, kept for revert.
    pub snapshot: String,
    /// Line-count change introduced by the replacement.
    pub line_delta: i64,
}

/// Splice `chosen_query` over the site's span. Every line of the replacement
/// after the first carries the indentation prefix of `line_start`. Returns a
/// stale-span error when the recorded text no longer sits in the slice.
pub fn apply_replacement(
    site: &QuerySite,
    chosen_query: &str,
) -> Result<AppliedSplice, PipelineError> {
    let snapshot = std::fs::read_to_string(&site.file_path)?;
    let had_trailing_newline = snapshot.ends_with('\n');
    let lines: Vec<&str> = snapshot.lines().collect();

    if site.line_start == 0 || site.line_end < site.line_start || site.line_end > lines.len() {
        return Err(PipelineError::QueryParseFailed(format!(
            "span {}..{} out of range for {}",
            site.line_start,
            site.line_end,
            site.file_path.display()
        )));
    }

    let slice = lines[site.line_start - 1..site.line_end].join("\n");
    let needle = site.original_text.as_str();
    if !slice.contains(needle) {
        return Err(PipelineError::QueryParseFailed(format!(
            "stale span: recorded text not found at {}:{}",
            site.file_path.display(),
            site.line_start
        )));
    }

    let indent: String = lines[site.line_start - 1]
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();
    let replacement = indent_continuation_lines(chosen_query.trim(), &indent);
    let new_slice = slice.replacen(needle, &replacement, 1);

    let old_span_lines = (site.line_end - site.line_start + 1) as i64;
    let new_span_lines = new_slice.lines().count() as i64;

    let mut new_content = String::new();
    for line in &lines[..site.line_start - 1] {
        new_content.push_str(line);
        new_content.push('\n');
    }
    new_content.push_str(&new_slice);
    for line in &lines[site.line_end..] {
        new_content.push('\n');
        new_content.push_str(line);
    }
    if had_trailing_newline {
        new_content.push('\n');
    }

    std::fs::write(&site.file_path, &new_content)?;
    debug!(
        file = %site.file_path.display(),
        delta = new_span_lines - old_span_lines,
        "replacement applied"
    );

    Ok(AppliedSplice {
        snapshot,
        line_delta: new_span_lines - old_span_lines,
    })
}

/// Restore a file to its pre-replacement snapshot.
pub fn revert_file(path: &Path, snapshot: &str) -> Result<(), PipelineError> {
    std::fs::write(path, snapshot)?;
    Ok(())
}

/// Shift the spans of later sites in the same file after a replacement
/// changed its line count.
pub fn shift_later_sites(
    sites: &mut [QuerySite],
    file: &Path,
    after_line: usize,
    delta: i64,
) {
    if delta == 0 {
        return;
    }
    for site in sites {
        if site.file_path == file && site.line_start > after_line {
            site.line_start = (site.line_start as i64 + delta) as usize;
            site.line_end = (site.line_end as i64 + delta) as usize;
        }
    }
}

fn indent_continuation_lines(text: &str, indent: &str) -> String {
    let mut out = String::new();
    for (index, line) in text.lines().enumerate() {
        if index > 0 {
            out.push('\n');
            out.push_str(indent);
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::llm::ScriptedLlm;

    struct ScriptedProbe {
        /// `(query fragment, measure)` pairs; first fragment match wins.
        plans: Vec<(String, Result<PlanMeasure, String>)>,
        briefs: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(plans: Vec<(&str, Result<PlanMeasure, String>)>) -> Self {
            Self {
                plans: plans
                    .into_iter()
                    .map(|(fragment, measure)| (fragment.to_string(), measure))
                    .collect(),
                briefs: Mutex::new(Vec::new()),
            }
        }
    }

    impl PlanProbe for ScriptedProbe {
        fn table_brief(&self, table: &str) -> Result<String, PipelineError> {
            self.briefs.lock().expect("briefs").push(table.to_string());
            Ok(format!("TABLE {table} (id integer)"))
        }

        fn explain(&self, query: &str) -> Result<PlanMeasure, PipelineError> {
            for (fragment, measure) in &self.plans {
                if query.contains(fragment.as_str()) {
                    return measure
                        .clone()
                        .map_err(PipelineError::QueryParseFailed);
                }
            }
            Err(PipelineError::QueryParseFailed(format!(
                "no scripted plan for '{query}'"
            )))
        }
    }

    fn site(file: &Path, start: usize, end: usize, text: &str) -> QuerySite {
        QuerySite {
            file_path: file.to_path_buf(),
            symbol: "load".to_string(),
            line_start: start,
            line_end: end,
            original_text: text.to_string(),
            dialect: "postgresql".to_string(),
            referenced_tables: vec!["users".to_string()],
        }
    }

    fn measure(cost: f64, time: f64) -> PlanMeasure {
        PlanMeasure {
            total_cost: cost,
            execution_time_ms: time,
        }
    }

    #[test]
    fn picks_cheapest_candidate_and_computes_rate() {
        let llm = ScriptedLlm::new(vec![r#"["Q_A", "Q_B", "Q_C"]"#.to_string()]);
        let probe = ScriptedProbe::new(vec![
            ("SELECT * FROM users", Ok(measure(37.8, 5.0))),
            ("Q_A", Ok(measure(20.0, 2.0))),
            ("Q_B", Ok(measure(12.4, 1.0))),
            ("Q_C", Ok(measure(30.0, 0.5))),
        ]);
        let site = site(Path::new("/tmp/x.py"), 1, 1, "SELECT * FROM users");

        let decision = optimize_site(&site, &llm, &probe).expect("optimize");
        assert_eq!(decision.chosen_query.as_deref(), Some("Q_B"));
        let report = decision.report;
        assert_eq!(report.outcome, SiteOutcome::Rewritten);
        assert_eq!(report.original_cost, Some(37.8));
        assert_eq!(report.chosen_cost, Some(12.4));
        assert!((report.improvement_rate - 67.19).abs() < 0.1);
    }

    #[test]
    fn cost_tie_breaks_on_runtime_then_order() {
        let llm = ScriptedLlm::new(vec![r#"["Q_A", "Q_B", "Q_C"]"#.to_string()]);
        let probe = ScriptedProbe::new(vec![
            ("ORIGINAL", Ok(measure(50.0, 5.0))),
            ("Q_A", Ok(measure(10.0, 3.0))),
            ("Q_B", Ok(measure(10.0, 1.0))),
            ("Q_C", Ok(measure(10.0, 1.0))),
        ]);
        let site = site(Path::new("/tmp/x.py"), 1, 1, "SELECT ORIGINAL");

        let decision = optimize_site(&site, &llm, &probe).expect("optimize");
        // Q_B and Q_C tie on cost and runtime; stable order keeps Q_B.
        assert_eq!(decision.chosen_query.as_deref(), Some("Q_B"));
    }

    #[test]
    fn no_improvement_keeps_original() {
        let llm = ScriptedLlm::new(vec![r#"["Q_A", "Q_B", "Q_C"]"#.to_string()]);
        let probe = ScriptedProbe::new(vec![
            ("ORIGINAL", Ok(measure(10.0, 1.0))),
            ("Q_A", Ok(measure(10.0, 0.5))),
            ("Q_B", Ok(measure(15.0, 0.1))),
            ("Q_C", Ok(measure(99.0, 0.1))),
        ]);
        let site = site(Path::new("/tmp/x.py"), 1, 1, "SELECT ORIGINAL");

        let decision = optimize_site(&site, &llm, &probe).expect("optimize");
        assert!(decision.chosen_query.is_none());
        assert_eq!(decision.report.outcome, SiteOutcome::NoImprovement);
        assert_eq!(decision.report.improvement_rate, 0.0);
    }

    #[test]
    fn malformed_candidates_skip_the_site() {
        let llm = ScriptedLlm::new(vec!["not json at all".to_string()]);
        let probe = ScriptedProbe::new(vec![("ORIGINAL", Ok(measure(10.0, 1.0)))]);
        let site = site(Path::new("/tmp/x.py"), 1, 1, "SELECT ORIGINAL");

        let decision = optimize_site(&site, &llm, &probe).expect("optimize");
        assert_eq!(decision.report.outcome, SiteOutcome::SkippedNoCandidates);
    }

    #[test]
    fn unmeasurable_baseline_skips_the_site() {
        let llm = ScriptedLlm::new(vec![r#"["Q_A", "Q_B", "Q_C"]"#.to_string()]);
        let probe = ScriptedProbe::new(vec![
            ("ORIGINAL", Err("syntax error".to_string())),
            ("Q_A", Ok(measure(1.0, 1.0))),
        ]);
        let site = site(Path::new("/tmp/x.py"), 1, 1, "SELECT ORIGINAL");

        let decision = optimize_site(&site, &llm, &probe).expect("optimize");
        assert_eq!(decision.report.outcome, SiteOutcome::SkippedBaseline);
    }

    #[test]
    fn database_outage_stops_the_subloop() {
        struct DownProbe;
        impl PlanProbe for DownProbe {
            fn table_brief(&self, _table: &str) -> Result<String, PipelineError> {
                Err(PipelineError::DatabaseUnavailable("down".to_string()))
            }
            fn explain(&self, _query: &str) -> Result<PlanMeasure, PipelineError> {
                Err(PipelineError::DatabaseUnavailable("down".to_string()))
            }
        }
        let llm = ScriptedLlm::new(vec![r#"["Q_A", "Q_B", "Q_C"]"#.to_string()]);
        let site = site(Path::new("/tmp/x.py"), 1, 1, "SELECT ORIGINAL");

        let err = optimize_site(&site, &llm, &DownProbe).unwrap_err();
        assert_eq!(err.kind(), "DatabaseUnavailable");
    }

    fn write_temp(content: &str) -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("repo.py");
        std::fs::write(&path, content).expect("write");
        (temp, path)
    }

    #[test]
    fn replacement_preserves_indentation_prefix() {
        let content = "def load(conn):\n    q = \"SELECT * FROM users\"\n    return conn.execute(q)\n";
        let (_temp, path) = write_temp(content);
        let site = site(&path, 2, 2, "SELECT * FROM users");

        let applied =
            apply_replacement(&site, "SELECT id, name\nFROM users\nWHERE active").expect("apply");
        assert_eq!(applied.line_delta, 2);

        let updated = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            updated,
            "def load(conn):\n    q = \"SELECT id, name\n    FROM users\n    WHERE active\"\n    return conn.execute(q)\n"
        );
    }

    #[test]
    fn identical_replacement_is_byte_identical() {
        let content = "q = \"SELECT * FROM users\"\nprint(q)\n";
        let (_temp, path) = write_temp(content);
        let site = site(&path, 1, 1, "SELECT * FROM users");

        let applied = apply_replacement(&site, "SELECT * FROM users").expect("apply");
        assert_eq!(applied.line_delta, 0);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), content);
    }

    #[test]
    fn revert_restores_snapshot_bytes() {
        let content = "q = \"SELECT * FROM users\"\n";
        let (_temp, path) = write_temp(content);
        let site = site(&path, 1, 1, "SELECT * FROM users");

        let applied = apply_replacement(&site, "SELECT 1").expect("apply");
        assert_ne!(std::fs::read_to_string(&path).expect("read"), content);

        revert_file(&path, &applied.snapshot).expect("revert");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), content);
    }

    #[test]
    fn stale_span_is_rejected() {
        let content = "nothing here\n";
        let (_temp, path) = write_temp(content);
        let site = site(&path, 1, 1, "SELECT * FROM users");

        let err = apply_replacement(&site, "SELECT 1").unwrap_err();
        assert_eq!(err.kind(), "QueryParseFailed");
        assert!(err.to_string().contains("stale span"));
    }

    #[test]
    fn later_sites_shift_by_line_delta() {
        let file = PathBuf::from("/tmp/x.py");
        let other = PathBuf::from("/tmp/y.py");
        let mut sites = vec![
            site(&file, 5, 5, "A"),
            site(&file, 10, 12, "B"),
            site(&other, 10, 10, "C"),
        ];

        shift_later_sites(&mut sites, &file, 5, 2);
        assert_eq!((sites[0].line_start, sites[0].line_end), (5, 5));
        assert_eq!((sites[1].line_start, sites[1].line_end), (12, 14));
        assert_eq!((sites[2].line_start, sites[2].line_end), (10, 10));
    }

    #[test]
    fn improvement_rate_uses_max_denominator() {
        assert!((improvement_rate(37.8, 12.4) - 67.19).abs() < 0.1);
        assert_eq!(improvement_rate(0.5, 0.25), 25.0);
    }
}
