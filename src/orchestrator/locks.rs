//! Per-conversation exclusion tokens
//!
//! An arena of async mutexes keyed by conversation id. Holding the returned
//! guard is holding the conversation; dropping it on any exit path releases
//! it. Waiters are served in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OwnedMutexGuard;

/// Prune dead entries once the arena grows past this many ids
const PRUNE_THRESHOLD: usize = 128;

/// Proof that the current turn owns its conversation
pub struct ConversationToken {
    conversation_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl ConversationToken {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl std::fmt::Debug for ConversationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationToken")
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

#[derive(Default)]
pub struct ConversationLocks {
    // Weak entries: a lock lives only while a holder or waiter references it
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        // The map holds no invariant a panicking holder could break
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());

        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait until no other turn holds `conversation_id`.
    pub async fn acquire(&self, conversation_id: &str) -> ConversationToken {
        let lock = self.slot(conversation_id);
        ConversationToken {
            conversation_id: conversation_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Whether a turn currently holds `conversation_id`
    pub fn is_held(&self, conversation_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .get(conversation_id)
            .and_then(Weak::upgrade)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Ids with a live lock (held or awaited)
    pub fn live_count(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_conversation_waits() {
        let locks = Arc::new(ConversationLocks::new());
        let first = locks.acquire("c1").await;
        assert!(locks.is_held("c1"));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("c1").await.conversation_id().to_string() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "c1");
    }

    #[tokio::test]
    async fn test_different_conversations_do_not_block() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_not_retained() {
        let locks = ConversationLocks::new();
        {
            let _token = locks.acquire("gone").await;
            assert_eq!(locks.live_count(), 1);
        }
        assert_eq!(locks.live_count(), 0);
        assert!(!locks.is_held("gone"));
    }

    #[tokio::test]
    async fn test_arena_prunes_dead_entries() {
        let locks = ConversationLocks::new();
        for i in 0..(PRUNE_THRESHOLD + 10) {
            let _token = locks.acquire(&format!("c{i}")).await;
        }
        let size = locks.locks.lock().unwrap().len();
        assert!(size <= PRUNE_THRESHOLD + 1);
    }
}
