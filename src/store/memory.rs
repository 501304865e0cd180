//! In-process conversation store

use super::{tail, Conversation, ConversationStore, Message};
use crate::{CompanionError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    /// (user_id, companion_id) -> conversation
    conversations: HashMap<(String, String), Conversation>,
    messages: HashMap<String, Vec<Message>>,
}

/// Store that keeps everything in memory. Used by tests and ephemeral chats.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    inner: RwLock<Inner>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for a conversation
    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.inner
            .read()
            .await
            .messages
            .get(conversation_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn find_conversation(
        &self,
        user_id: &str,
        companion_id: &str,
    ) -> Result<Option<Conversation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .get(&(user_id.to_string(), companion_id.to_string()))
            .cloned())
    }

    async fn create_conversation(&self, user_id: &str, companion_id: &str) -> Result<Conversation> {
        let mut inner = self.inner.write().await;
        let key = (user_id.to_string(), companion_id.to_string());
        if let Some(existing) = inner.conversations.get(&key) {
            return Ok(existing.clone());
        }
        let conversation = Conversation::new(user_id, companion_id);
        inner
            .messages
            .insert(conversation.id.clone(), Vec::new());
        inner.conversations.insert(key, conversation.clone());
        Ok(conversation)
    }

    async fn list_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        Ok(tail(self.list_messages(conversation_id).await?, limit))
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| {
                CompanionError::Persistence(format!("unknown conversation {conversation_id}"))
            })
    }

    async fn append_message_pair(
        &self,
        conversation_id: &str,
        user: &Message,
        assistant: &Message,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let messages = inner.messages.get_mut(conversation_id).ok_or_else(|| {
            CompanionError::Persistence(format!("unknown conversation {conversation_id}"))
        })?;
        messages.push(user.clone());
        messages.push(assistant.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageRole;
    use chrono::Utc;

    #[tokio::test]
    async fn test_create_is_find_or_create() {
        let store = MemoryConversationStore::new();
        assert!(store.find_conversation("u1", "luna").await.unwrap().is_none());

        let first = store.create_conversation("u1", "luna").await.unwrap();
        let second = store.create_conversation("u1", "luna").await.unwrap();
        assert_eq!(first.id, second.id);

        let other = store.create_conversation("u2", "luna").await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn test_append_and_list_recent() {
        let store = MemoryConversationStore::new();
        let conv = store.create_conversation("u1", "luna").await.unwrap();
        for i in 0..3 {
            let user = Message::new(&conv.id, MessageRole::User, format!("q{i}"), Utc::now());
            let asst = Message::new(&conv.id, MessageRole::Assistant, format!("a{i}"), Utc::now());
            store.append_message_pair(&conv.id, &user, &asst).await.unwrap();
        }
        assert_eq!(store.message_count(&conv.id).await, 6);

        let recent = store.list_recent_messages(&conv.id, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_append_to_unknown_conversation_fails() {
        let store = MemoryConversationStore::new();
        let user = Message::new("nope", MessageRole::User, "hi", Utc::now());
        let asst = Message::new("nope", MessageRole::Assistant, "hello", Utc::now());
        let err = store.append_message_pair("nope", &user, &asst).await.unwrap_err();
        assert_eq!(err.reason(), "persistence_error");
    }
}
