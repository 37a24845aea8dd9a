//! Pipeline configuration stored at `.commitly/config.yaml`.
//!
//! Values may reference environment variables as `${NAME}`; the whole value is
//! substituted when the variable is set and left as-is otherwise. Missing
//! fields default to sensible values so a scaffolded config stays short.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub git: GitConfig,
    pub execution: ExecutionConfig,
    pub test: TestConfig,
    pub database: Option<DatabaseConfig>,
    pub llm: LlmConfig,
    pub refactoring: RefactoringConfig,
    pub pipeline: PipelineConfig,
    pub notify: NotifyConfig,
    pub report: ReportConfig,
    pub sql: SqlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Remote name for fetch/push; `origin` unless overridden.
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Primary run command (the project's main entrypoint). Required.
    pub command: String,
    /// Wall-clock budget for the primary command in seconds.
    pub timeout: u64,
    /// Interpreter binary path; resolved at pipeline start when unset.
    pub python_bin: Option<String>,
    /// Static analysis commands run over the hub. Missing tools are skipped
    /// with a warning.
    pub static_checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Project test command. Required.
    pub command: String,
    /// Wall-clock budget for the test command in seconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub dialect: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            dialect: "postgresql".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub model: String,
    pub api_key: String,
    /// Command the language-model client shells out to. The prompt arrives on
    /// stdin; the completion is read from stdout.
    pub command: Vec<String>,
    /// Per-call budget in seconds.
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: String::new(),
            api_key: String::new(),
            command: Vec::new(),
            timeout: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefactoringConfig {
    /// Rule set handed to the language model.
    pub rules: String,
    /// Formatter / auto-fixer run over each refactored file. The file path is
    /// appended as the last argument. Missing tool is skipped.
    pub fix_command: Vec<String>,
}

impl Default for RefactoringConfig {
    fn default() -> Self {
        Self {
            rules: "Remove duplicated code by extracting common functions; wrap risky \
                    I/O, network, and database calls in exception handlers with logging; \
                    keep public signatures unchanged."
                .to_string(),
            fix_command: vec!["ruff".to_string(), "check".to_string(), "--fix".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Remove the hub directory entirely when a run fails.
    pub cleanup_hub_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub channel: String,
    /// Message search window in days.
    pub window_days: u32,
    /// Extra keywords matched against chat messages.
    pub keywords: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: String::new(),
            window_days: 7,
            keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// `md` is always supported; other formats degrade to markdown.
    pub format: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: "md".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SqlConfig {
    /// Leading keywords that mark a string literal as an embedded query.
    pub keywords: Vec<String>,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            keywords: ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout: 300,
            python_bin: None,
            static_checks: vec!["ruff check .".to_string(), "mypy .".to_string()],
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout: 300,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git: GitConfig::default(),
            execution: ExecutionConfig::default(),
            test: TestConfig::default(),
            database: None,
            llm: LlmConfig::default(),
            refactoring: RefactoringConfig::default(),
            pipeline: PipelineConfig::default(),
            notify: NotifyConfig::default(),
            report: ReportConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.execution.command.trim().is_empty() {
            return Err(PipelineError::ConfigurationMissing(
                "execution.command is required".to_string(),
            ));
        }
        if self.test.command.trim().is_empty() {
            return Err(PipelineError::ConfigurationMissing(
                "test.command is required".to_string(),
            ));
        }
        if self.execution.timeout == 0 || self.test.timeout == 0 {
            return Err(PipelineError::ConfigurationMissing(
                "timeouts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load the config from a YAML file, substituting `${NAME}` values.
pub fn load_config(path: &Path) -> Result<Config, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::ConfigurationMissing(format!(
            "config not found at {} (run `commitly init` first)",
            path.display()
        )));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))
        .map_err(|err| PipelineError::ConfigurationMissing(format!("{err:#}")))?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&contents)
        .map_err(|err| PipelineError::ConfigurationMissing(format!("parse {}: {err}", path.display())))?;
    substitute_env(&mut value);
    let config: Config = serde_yaml::from_value(value)
        .map_err(|err| PipelineError::ConfigurationMissing(format!("parse {}: {err}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Replace whole-string `${NAME}` values with the environment variable's
/// value. Unset variables leave the original text in place.
fn substitute_env(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                if let Ok(resolved) = std::env::var(name) {
                    *s = resolved;
                }
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                substitute_env(item);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env(item);
            }
        }
        _ => {}
    }
}

/// Config template written by `commitly init`.
pub fn scaffold_yaml(command: &str, test_command: &str, python_bin: Option<&str>) -> String {
    let python_line = match python_bin {
        Some(bin) => format!("  python_bin: {bin}\n"),
        None => String::new(),
    };
    format!(
        "git:\n  remote: origin\nexecution:\n  command: \"{command}\"\n  timeout: 300\n{python_line}test:\n  command: \"{test_command}\"\n  timeout: 300\nllm:\n  enabled: false\n  model: \"\"\n  api_key: \"${{LLM_API_KEY}}\"\npipeline:\n  cleanup_hub_on_failure: false\nnotify:\n  enabled: false\nreport:\n  format: md\n"
    )
}
