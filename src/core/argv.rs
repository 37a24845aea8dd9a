//! Shell-aware splitting for configured command strings.
//!
//! Configured commands are single strings (`execution.command`,
//! `test.command`). Paths containing spaces must survive as one argument, so
//! splitting honors quotes and escapes. Naive whitespace splitting is
//! forbidden here.

use crate::core::error::PipelineError;

/// Split a command string into argv entries with shell quoting semantics.
pub fn split_command(command: &str) -> Result<Vec<String>, PipelineError> {
    let words = shell_words::split(command).map_err(|err| {
        PipelineError::ConfigurationMissing(format!("unparsable command '{command}': {err}"))
    })?;
    if words.is_empty() {
        return Err(PipelineError::ConfigurationMissing(format!(
            "empty command '{command}'"
        )));
    }
    Ok(words)
}

/// Split into `(program, args)`.
pub fn program_and_args(command: &str) -> Result<(String, Vec<String>), PipelineError> {
    let mut words = split_command(command)?;
    let program = words.remove(0);
    Ok((program, words))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_path_with_spaces_stays_one_argument() {
        let words = split_command("python 'my script.py'").expect("split");
        assert_eq!(words, vec!["python", "my script.py"]);
    }

    #[test]
    fn double_quotes_and_escapes() {
        let words = split_command(r#"pytest -k "slow test" --maxfail=1"#).expect("split");
        assert_eq!(words, vec!["pytest", "-k", "slow test", "--maxfail=1"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = split_command("   ").unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn unbalanced_quote_is_rejected() {
        assert!(split_command("python 'oops").is_err());
    }

    #[test]
    fn program_split() {
        let (program, args) = program_and_args("python 'my script.py'").expect("split");
        assert_eq!(program, "python");
        assert_eq!(args, vec!["my script.py"]);
    }
}
