//! Language-model handle.
//!
//! The [`LlmHandle`] trait decouples the pipeline from the actual model
//! backend. The production backend shells out to a configured command (prompt
//! on stdin, completion on stdout); tests use scripted handles that return
//! predetermined completions without spawning processes.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::config::LlmConfig;
use crate::core::error::PipelineError;
use crate::io::process::{run_command, ExecSpec};

/// Abstraction over language-model backends.
pub trait LlmHandle {
    /// Single completion: `system` frames the task, `prompt` carries it.
    fn complete(&self, prompt: &str, system: &str) -> Result<String, PipelineError>;

    /// Exactly `n` functionally-identical alternative queries, or an error
    /// when the response cannot be parsed as such.
    fn suggest_queries(
        &self,
        schema: &str,
        query: &str,
        dialect: &str,
        n: usize,
    ) -> Result<Vec<String>, PipelineError> {
        let system = format!(
            "You are a {dialect} performance engineer. You rewrite SQL queries into \
             functionally identical alternatives: same projected columns and types, \
             same result multiset under the same parameters. Never emit DDL."
        );
        let prompt = format!(
            "# SCHEMA\n{schema}\n\n# ORIGINAL QUERY\n```sql\n{query}\n```\n\n\
             # INSTRUCTION\nProduce exactly {n} alternative queries that may perform \
             better. Respond with a JSON array of {n} strings and nothing else."
        );
        let response = self.complete(&prompt, &system)?;
        parse_query_candidates(&response, n)
    }

    /// A refactored version of `code` under the given rule set. The model
    /// must keep public signatures unchanged.
    fn suggest_refactoring(
        &self,
        code: &str,
        file_path: &str,
        rules: &str,
    ) -> Result<String, PipelineError> {
        let system = "You are a code refactoring assistant. Apply the given rules and \
                      return only the resulting code, with no commentary and no markdown \
                      fences."
            .to_string();
        let prompt = format!(
            "# FILE: {file_path}\n\n# RULES\n{rules}\n\n# ORIGINAL CODE\n{code}\n\n\
             # INSTRUCTION\nReturn the full refactored file. If no change is needed, \
             return the original code unchanged."
        );
        let response = self.complete(&prompt, &system)?;
        Ok(sanitize_code_response(&response))
    }
}

/// Backend that pipes the prompt into a configured command and reads the
/// completion from its stdout. Model name and API key travel via environment.
pub struct CommandLlm {
    command: Vec<String>,
    model: String,
    api_key: String,
    timeout: Duration,
    workdir: PathBuf,
}

impl CommandLlm {
    /// Build from config; `None` when the handle is disabled or unconfigured.
    pub fn from_config(config: &LlmConfig, workdir: &std::path::Path) -> Option<Self> {
        if !config.enabled || config.command.is_empty() {
            return None;
        }
        Some(Self {
            command: config.command.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout),
            workdir: workdir.to_path_buf(),
        })
    }
}

impl LlmHandle for CommandLlm {
    #[instrument(skip_all, fields(prompt_len = prompt.len()))]
    fn complete(&self, prompt: &str, system: &str) -> Result<String, PipelineError> {
        let mut spec = ExecSpec::new(&self.command[0], &self.workdir);
        spec.args = self.command[1..].to_vec();
        spec.timeout = self.timeout;
        spec.stdin = Some(format!("{system}\n\n{prompt}").into_bytes());
        if !self.model.is_empty() {
            spec.envs.push(("LLM_MODEL".to_string(), self.model.clone()));
        }
        if !self.api_key.is_empty() {
            spec.envs.push(("LLM_API_KEY".to_string(), self.api_key.clone()));
        }

        let output = run_command(&spec)
            .map_err(|err| PipelineError::LlmUnavailable(format!("{err:#}")))?;
        if output.timed_out {
            return Err(PipelineError::Timeout(self.timeout));
        }
        if !output.status.success() {
            return Err(PipelineError::LlmUnavailable(format!(
                "backend exited with {:?}: {}",
                output.exit_code(),
                output.stderr_lossy().trim()
            )));
        }
        debug!(chars = output.stdout.len(), "completion received");
        Ok(output.stdout_lossy())
    }
}

/// Parse a JSON array of exactly `n` query strings, tolerating a fenced code
/// block around the array.
pub fn parse_query_candidates(response: &str, n: usize) -> Result<Vec<String>, PipelineError> {
    let body = strip_code_fences(response);
    let candidates: Vec<String> = serde_json::from_str(body.trim()).map_err(|err| {
        PipelineError::QueryParseFailed(format!("candidate response is not a JSON array: {err}"))
    })?;
    if candidates.len() != n {
        return Err(PipelineError::QueryParseFailed(format!(
            "expected {n} candidates, got {}",
            candidates.len()
        )));
    }
    if candidates.iter().any(|c| c.trim().is_empty()) {
        return Err(PipelineError::QueryParseFailed(
            "empty candidate in response".to_string(),
        ));
    }
    Ok(candidates)
}

/// Remove markdown code fences and any language tag from a model response.
pub fn sanitize_code_response(response: &str) -> String {
    strip_code_fences(response).trim_end().to_string()
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line, then the closing fence.
    let rest = match rest.split_once('\n') {
        Some((_tag, body)) => body,
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim_end).unwrap_or(rest)
}

/// Scripted handle for tests: returns queued completions in order.
pub struct ScriptedLlm {
    completions: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(completions: Vec<String>) -> Self {
        Self {
            completions: Mutex::new(completions),
        }
    }
}

impl LlmHandle for ScriptedLlm {
    fn complete(&self, _prompt: &str, _system: &str) -> Result<String, PipelineError> {
        let mut queue = self
            .completions
            .lock()
            .map_err(|_| PipelineError::LlmUnavailable("scripted queue poisoned".to_string()))?;
        if queue.is_empty() {
            warn!("scripted llm exhausted");
            return Err(PipelineError::LlmUnavailable(
                "no scripted completion left".to_string(),
            ));
        }
        Ok(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_array() {
        let candidates =
            parse_query_candidates(r#"["SELECT 1", "SELECT 2", "SELECT 3"]"#, 3).expect("parse");
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], "SELECT 1");
    }

    #[test]
    fn parses_fenced_json_array() {
        let response = "```json\n[\"SELECT a FROM t\", \"SELECT a FROM t WHERE 1=1\", \"TABLE t\"]\n```";
        let candidates = parse_query_candidates(response, 3).expect("parse");
        assert_eq!(candidates[2], "TABLE t");
    }

    #[test]
    fn wrong_count_is_a_parse_failure() {
        let err = parse_query_candidates(r#"["SELECT 1"]"#, 3).unwrap_err();
        assert_eq!(err.kind(), "QueryParseFailed");
    }

    #[test]
    fn prose_is_a_parse_failure() {
        let err = parse_query_candidates("Here are some ideas...", 3).unwrap_err();
        assert_eq!(err.kind(), "QueryParseFailed");
    }

    #[test]
    fn sanitize_strips_fences_and_language_tag() {
        let response = "```python\ndef f():\n    return 1\n```";
        assert_eq!(sanitize_code_response(response), "def f():\n    return 1");
        assert_eq!(sanitize_code_response("plain\n"), "plain");
    }

    #[test]
    fn default_suggest_queries_uses_complete() {
        let llm = ScriptedLlm::new(vec![r#"["Q1", "Q2", "Q3"]"#.to_string()]);
        let candidates = llm
            .suggest_queries("table users", "SELECT * FROM users", "postgresql", 3)
            .expect("suggest");
        assert_eq!(candidates, vec!["Q1", "Q2", "Q3"]);
    }

    #[test]
    fn scripted_llm_exhaustion_is_unavailable() {
        let llm = ScriptedLlm::new(Vec::new());
        let err = llm.complete("p", "s").unwrap_err();
        assert_eq!(err.kind(), "LLMUnavailable");
    }
}
