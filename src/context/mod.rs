//! Context window assembly
//!
//! A window is the persona preamble, the most recent prior messages in
//! chronological order, and the new user input last.

use crate::modality::CanonicalText;
use crate::persona::Preamble;
use crate::store::{Message, MessageRole};
use crate::DEFAULT_WINDOW_SIZE;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for PromptRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered prompt for a single model call.
///
/// Always starts with exactly one system message and ends with the new user
/// input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptContext {
    messages: Vec<PromptMessage>,
}

impl PromptContext {
    pub fn messages(&self) -> &[PromptMessage] {
        &self.messages
    }

    /// The preamble text
    pub fn system(&self) -> &str {
        &self.messages[0].content
    }

    /// Prior messages and the new input, without the preamble
    pub fn turns(&self) -> &[PromptMessage] {
        &self.messages[1..]
    }

    /// Prior messages only
    pub fn history(&self) -> &[PromptMessage] {
        &self.messages[1..self.messages.len() - 1]
    }

    /// The new user input
    pub fn latest_input(&self) -> &str {
        &self.messages[self.messages.len() - 1].content
    }

    /// Rough size for logging (bytes of content)
    pub fn content_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Builds bounded context windows. Reads a history snapshot, never mutates it.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindowBuilder {
    window_size: usize,
}

impl Default for ContextWindowBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ContextWindowBuilder {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// `history` must be chronological; only its last `window_size` entries
    /// are used, whatever its length.
    pub fn build(
        &self,
        history: &[Message],
        preamble: &Preamble,
        input: &CanonicalText,
    ) -> PromptContext {
        let start = history.len().saturating_sub(self.window_size);
        let recent = &history[start..];

        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(PromptMessage::new(PromptRole::System, preamble.as_str()));
        messages.extend(
            recent
                .iter()
                .map(|m| PromptMessage::new(m.role.into(), m.content.clone())),
        );
        messages.push(PromptMessage::new(PromptRole::User, input.as_str()));

        PromptContext { messages }
    }
}
