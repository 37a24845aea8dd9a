//! Notify agent: match collaborator chatter to the commit and reply.
//!
//! Non-blocking: any failure here is recorded and the pipeline's terminal
//! status is not downgraded.

use anyhow::Result;
use serde_json::json;

use crate::agents::{Agent, AgentLog, PipelineEnv};
use crate::chat::ChatMessage;
use crate::core::context::RunContext;

pub struct NotifyAgent;

impl Agent for NotifyAgent {
    fn name(&self) -> &'static str {
        "notify_agent"
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
        if !env.config.notify.enabled {
            log.info("notify disabled, skipping");
            return Ok(json!({"skipped": "disabled", "matched": [], "replied": []}));
        }
        let Some(notifier) = env.notifier.as_ref() else {
            log.warn("no chat notifier configured, skipping");
            return Ok(json!({"skipped": "unconfigured", "matched": [], "replied": []}));
        };

        let messages = notifier.search(env.config.notify.window_days)?;
        log.info(&format!("{} message(s) in window", messages.len()));

        let commit_message = ctx
            .user_commit_message
            .clone()
            .or_else(|| ctx.user_commits.first().map(|c| c.message.clone()))
            .unwrap_or_default();
        let file_names: Vec<String> = ctx
            .changed_files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();

        let mut matched = Vec::new();
        let mut replied = Vec::new();
        for message in &messages {
            let Some(reason) =
                match_reason(message, &commit_message, &file_names, &env.config.notify.keywords)
            else {
                continue;
            };

            matched.push(json!({
                "id": message.id,
                "author": message.author,
                "reason": reason,
            }));

            let reply = format!(
                "Resolved by commit \"{commit_message}\" (matched on {reason}). \
                 This reply was posted automatically by commitly."
            );
            match notifier.reply(&message.id, &reply) {
                Ok(()) => replied.push(message.id.clone()),
                Err(err) => log.warn(&format!("reply to {} failed: {err}", message.id)),
            }
        }

        log.info(&format!("{} matched, {} replied", matched.len(), replied.len()));
        Ok(json!({"matched": matched, "replied": replied}))
    }
}

fn match_reason(
    message: &ChatMessage,
    commit_message: &str,
    file_names: &[String],
    keywords: &[String],
) -> Option<String> {
    let text = message.text.to_lowercase();
    if !commit_message.is_empty() && text.contains(&commit_message.to_lowercase()) {
        return Some("commit message".to_string());
    }
    for name in file_names {
        if text.contains(&name.to_lowercase()) {
            return Some(format!("file {name}"));
        }
    }
    for keyword in keywords {
        if text.contains(&keyword.to_lowercase()) {
            return Some(format!("keyword {keyword}"));
        }
    }
    None
}
