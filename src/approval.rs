//! The approval gate.
//!
//! Sync is the only agent that may solicit human input. The source of the
//! answer is pluggable so the gate stays deterministic under test: an
//! interactive terminal, a scripted answer, or a file-based gate.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

/// Human-readable summary shown before the yes/no question.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApprovalSummary {
    pub commit_message: String,
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
    pub query_sites: usize,
    pub optimized_queries: usize,
    pub refactored_files: usize,
    pub push_target: String,
}

impl ApprovalSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Commitly change summary\n");
        out.push_str(&format!("  commit:  {}\n", self.commit_message));
        out.push_str(&format!(
            "  files:   {} changed (+{} / -{})\n",
            self.files_changed, self.additions, self.deletions
        ));
        // The gate is only reachable with a green suite.
        out.push_str("  tests:   passed\n");
        if self.query_sites > 0 {
            out.push_str(&format!(
                "  queries: {} found, {} optimized\n",
                self.query_sites, self.optimized_queries
            ));
        }
        if self.refactored_files > 0 {
            out.push_str(&format!("  refactor: {} file(s) improved\n", self.refactored_files));
        }
        out.push_str(&format!("  push to: {}\n", self.push_target));
        out
    }
}

/// Source of the single human decision in the pipeline.
pub trait Approval {
    fn ask(&self, summary: &ApprovalSummary) -> Result<bool>;
}

/// Asks on the controlling terminal; anything but `y`/`yes` declines.
pub struct InteractiveApproval;

impl Approval for InteractiveApproval {
    fn ask(&self, summary: &ApprovalSummary) -> Result<bool> {
        let mut stdout = std::io::stdout().lock();
        write!(
            stdout,
            "\n{}\nPush these changes? (y/n): ",
            summary.render()
        )
        .context("write approval prompt")?;
        stdout.flush().context("flush approval prompt")?;

        let mut answer = String::new();
        // EOF (no line read) counts as a decline.
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read approval answer")?;
        Ok(is_yes(&answer))
    }
}

/// Fixed answer, for non-interactive runs and tests.
pub struct ScriptedApproval(pub bool);

impl Approval for ScriptedApproval {
    fn ask(&self, _summary: &ApprovalSummary) -> Result<bool> {
        Ok(self.0)
    }
}

/// Reads the decision from a file: a body of `yes`/`y` approves, anything
/// else (including a missing file) declines.
pub struct FileApproval {
    pub path: PathBuf,
}

impl Approval for FileApproval {
    fn ask(&self, _summary: &ApprovalSummary) -> Result<bool> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(is_yes(&contents)),
            Err(_) => Ok(false),
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_answer_is_returned_verbatim() {
        let summary = ApprovalSummary::default();
        assert!(ScriptedApproval(true).ask(&summary).expect("ask"));
        assert!(!ScriptedApproval(false).ask(&summary).expect("ask"));
    }

    #[test]
    fn file_gate_reads_yes_and_defaults_to_decline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gate");
        let summary = ApprovalSummary::default();

        let gate = FileApproval { path: path.clone() };
        assert!(!gate.ask(&summary).expect("missing file declines"));

        std::fs::write(&path, "yes\n").expect("write");
        assert!(gate.ask(&summary).expect("yes approves"));

        std::fs::write(&path, "nope").expect("write");
        assert!(!gate.ask(&summary).expect("other declines"));
    }

    #[test]
    fn summary_renders_counts() {
        let summary = ApprovalSummary {
            commit_message: "fix: speed up lookup".to_string(),
            files_changed: 2,
            additions: 10,
            deletions: 3,
            query_sites: 1,
            optimized_queries: 1,
            refactored_files: 1,
            push_target: "origin/main".to_string(),
        };
        let text = summary.render();
        assert!(text.contains("2 changed (+10 / -3)"));
        assert!(text.contains("1 found, 1 optimized"));
        assert!(text.contains("origin/main"));
    }
}
