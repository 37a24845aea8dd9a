//! Chat-platform notifier interface.
//!
//! Only the interface is owned here; a concrete platform client plugs in from
//! outside. Notify-agent failures are recorded and never abort the pipeline.

use crate::core::error::PipelineError;

/// One message from the configured channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Platform-specific id usable as a reply thread handle.
    pub id: String,
    pub author: String,
    pub text: String,
    pub timestamp: String,
}

/// Search and reply surface of the chat platform.
pub trait ChatNotifier {
    /// Messages from the configured channel within the last `window_days`.
    fn search(&self, window_days: u32) -> Result<Vec<ChatMessage>, PipelineError>;

    /// Attach a reply to the given message thread.
    fn reply(&self, thread_id: &str, text: &str) -> Result<(), PipelineError>;
}
