//! Conversation storage
//!
//! The orchestrator reads history and writes message pairs only through
//! [`ConversationStore`]. Records are owned by the store; callers re-read
//! what they need on every turn.

mod jsonl;
mod memory;

pub use jsonl::JsonlConversationStore;
pub use memory::MemoryConversationStore;

use crate::{CompanionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message history scoped to one (user, companion) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub companion_id: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: &str, companion_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            companion_id: companion_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: &str,
        role: MessageRole,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
            created_at,
        }
    }
}

/// Durable storage for conversations and their messages.
///
/// `append_message_pair` is the only write the orchestrator performs and must
/// record both messages or neither. Read methods return messages oldest first.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_conversation(
        &self,
        user_id: &str,
        companion_id: &str,
    ) -> Result<Option<Conversation>>;

    /// Create the conversation for a pair. Returns the existing one if the
    /// pair already has a conversation.
    async fn create_conversation(&self, user_id: &str, companion_id: &str) -> Result<Conversation>;

    /// The most recent `limit` messages, in chronological order.
    async fn list_recent_messages(&self, conversation_id: &str, limit: usize)
        -> Result<Vec<Message>>;

    /// The full transcript, in chronological order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn append_message_pair(
        &self,
        conversation_id: &str,
        user: &Message,
        assistant: &Message,
    ) -> Result<()>;

    /// `append_message_pair` bounded by `timeout`. A timeout is reported as
    /// `Persistence`, and any `Err` means neither message is stored.
    ///
    /// The default cancels the append future at the deadline, which is only
    /// sound for stores whose append has no effect until it returns.
    async fn append_message_pair_within(
        &self,
        conversation_id: &str,
        user: &Message,
        assistant: &Message,
        timeout: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(
            timeout,
            self.append_message_pair(conversation_id, user, assistant),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(write_timed_out(timeout)),
        }
    }
}

pub(crate) fn write_timed_out(timeout: Duration) -> CompanionError {
    CompanionError::Persistence(format!("message pair write timed out after {timeout:?}"))
}

/// Keep the last `limit` items of a chronological sequence.
pub(crate) fn tail<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    let start = items.len().saturating_sub(limit);
    items.drain(..start);
    items
}
