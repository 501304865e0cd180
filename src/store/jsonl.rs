//! File-backed conversation store.
//!
//! Directory layout:
//!   {root}/index.json          conversation records
//!   {root}/{conversation}.jsonl one line per user/assistant pair
//!
//! A pair is written with a single line append, so a crash can at worst leave
//! a torn trailing line, which readers skip.
//!
//! Appends run on the blocking pool and cannot be interrupted once started.
//! A deadline therefore never abandons a write: each append has one commit
//! point, and an append called off before it is truncated back to the length
//! the file had when it started. The store lock stays held until that
//! rollback is done, so no reader ever sees the line.

use super::{tail, write_timed_out, Conversation, ConversationStore, Message};
use crate::{CompanionError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One persisted turn
#[derive(Debug, Serialize, Deserialize)]
struct PairRecord {
    user: Message,
    assistant: Message,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    conversations: Vec<Conversation>,
}

impl Index {
    fn find(&self, user_id: &str, companion_id: &str) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| c.user_id == user_id && c.companion_id == companion_id)
    }

    fn contains_id(&self, conversation_id: &str) -> bool {
        self.conversations.iter().any(|c| c.id == conversation_id)
    }
}

pub struct JsonlConversationStore {
    root: PathBuf,
    /// Held by index rewrites, transcript reads and appends, including the
    /// rollback of an append that was called off
    lock: Arc<Mutex<()>>,
}

impl JsonlConversationStore {
    /// Open a store rooted at `root`. Creates the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(persistence)?;
        info!("Conversation store at {:?}", root);
        Ok(Self {
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn transcript_path(&self, conversation_id: &str) -> PathBuf {
        // Sanitize id for use as filename
        let safe_id: String = conversation_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{}.jsonl", safe_id))
    }

    async fn load_index(&self) -> Result<Index> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Index::default());
        }
        let content = fs::read_to_string(&path).await.map_err(persistence)?;
        serde_json::from_str(&content)
            .map_err(|e| CompanionError::Persistence(format!("corrupt index {:?}: {}", path, e)))
    }

    /// Write the index via tmp file + rename so readers never see half a file.
    async fn save_index(&self, index: &Index) -> Result<()> {
        let path = self.index_path();
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(index)?;
        let mut file = fs::File::create(&tmp).await.map_err(persistence)?;
        file.write_all(content.as_bytes()).await.map_err(persistence)?;
        file.sync_all().await.map_err(persistence)?;
        fs::rename(&tmp, &path).await.map_err(persistence)?;
        Ok(())
    }

    /// Caller holds `lock`.
    async fn read_pairs(&self, conversation_id: &str) -> Result<Vec<PairRecord>> {
        let path = self.transcript_path(conversation_id);
        if !path.exists() {
            if self.load_index().await?.contains_id(conversation_id) {
                return Ok(Vec::new());
            }
            return Err(CompanionError::Persistence(format!(
                "unknown conversation {conversation_id}"
            )));
        }
        let content = fs::read_to_string(&path).await.map_err(persistence)?;
        let mut pairs = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PairRecord>(line) {
                Ok(pair) => pairs.push(pair),
                Err(e) => warn!(
                    "Skipping unreadable line {} in {:?}: {}",
                    line_no + 1,
                    path,
                    e
                ),
            }
        }
        Ok(pairs)
    }

    /// Append one pair. With a `timeout`, the call returns by the deadline
    /// and its result always matches what the transcript holds.
    async fn append_pair(
        &self,
        conversation_id: &str,
        user: &Message,
        assistant: &Message,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let timed_out = || write_timed_out(timeout.unwrap_or_default());

        // Nothing is written before the blocking task starts, so giving up
        // here leaves the store untouched
        let guard = until(deadline, self.lock.clone().lock_owned())
            .await
            .ok_or_else(timed_out)?;
        let index = until(deadline, self.load_index())
            .await
            .ok_or_else(timed_out)??;
        if !index.contains_id(conversation_id) {
            return Err(CompanionError::Persistence(format!(
                "unknown conversation {conversation_id}"
            )));
        }

        let record = serde_json::to_string(&PairRecord {
            user: user.clone(),
            assistant: assistant.clone(),
        })?;
        let path = self.transcript_path(conversation_id);
        let state = Arc::new(AtomicU8::new(PENDING));
        let task = {
            let state = state.clone();
            tokio::task::spawn_blocking(move || write_pair_line(&path, &record, &state))
        };

        PendingWrite {
            state,
            task: Some(task),
            guard: Some(guard),
        }
        .settle(deadline, timed_out)
        .await
    }
}

fn persistence(e: std::io::Error) -> CompanionError {
    CompanionError::Persistence(e.to_string())
}

async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Exactly one of the writer and the waiter wins this race.
fn try_cancel(state: &AtomicU8) -> bool {
    state
        .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

fn called_off() -> CompanionError {
    CompanionError::Persistence("message pair write was called off".into())
}

/// Runs on the blocking pool. Returns `Ok` only if the line is on disk and
/// the write committed before anyone called it off.
fn write_pair_line(path: &Path, record: &str, state: &AtomicU8) -> Result<()> {
    if state.load(Ordering::SeqCst) == CANCELLED {
        return Err(called_off());
    }
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(persistence)?;
    let start = file.metadata().map_err(persistence)?.len();

    let mut line = String::with_capacity(record.len() + 2);
    // Terminate a torn line left by an earlier crash so it stays isolated
    if start > 0 && !ends_with_newline(&mut file).map_err(persistence)? {
        line.push('\n');
    }
    line.push_str(record);
    line.push('\n');

    if let Err(e) = file
        .write_all(line.as_bytes())
        .and_then(|()| file.sync_data())
    {
        if let Err(undo) = file.set_len(start) {
            warn!("Could not roll back partial append to {:?}: {}", path, undo);
        }
        return Err(persistence(e));
    }
    commit_or_rollback(&file, start, state)
}

fn ends_with_newline(file: &mut std::fs::File) -> std::io::Result<bool> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Commit point of an append. If the write was called off, the file is cut
/// back to `start`.
fn commit_or_rollback(file: &std::fs::File, start: u64, state: &AtomicU8) -> Result<()> {
    if state
        .compare_exchange(PENDING, COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        return Ok(());
    }
    file.set_len(start)
        .and_then(|()| file.sync_data())
        .map_err(persistence)?;
    debug!("Rolled back append called off at the deadline");
    Err(called_off())
}

/// An append handed to the blocking pool, together with the store lock.
struct PendingWrite {
    state: Arc<AtomicU8>,
    task: Option<JoinHandle<Result<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PendingWrite {
    async fn settle(
        mut self,
        deadline: Option<Instant>,
        timed_out: impl FnOnce() -> CompanionError,
    ) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = match until(deadline, &mut *task).await {
            Some(joined) => joined,
            None => {
                if try_cancel(&self.state) {
                    // Drop hands the lock to the rollback
                    return Err(timed_out());
                }
                // Committed just before the deadline, so report it
                task.await
            }
        };
        self.task = None;
        joined.map_err(|e| CompanionError::Persistence(format!("append task failed: {e}")))?
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        try_cancel(&self.state);
        if self.state.load(Ordering::SeqCst) == COMMITTED {
            return;
        }
        // The writer may be mid-append; keep the store locked until it has
        // rolled back
        let guard = self.guard.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Ok(Err(e)) = task.await {
                        debug!("Abandoned append finished: {}", e);
                    }
                    drop(guard);
                });
            }
            Err(_) => warn!("No runtime to await an abandoned append"),
        }
    }
}

#[async_trait::async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn find_conversation(
        &self,
        user_id: &str,
        companion_id: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self.load_index().await?.find(user_id, companion_id).cloned())
    }

    async fn create_conversation(&self, user_id: &str, companion_id: &str) -> Result<Conversation> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        if let Some(existing) = index.find(user_id, companion_id) {
            return Ok(existing.clone());
        }
        let conversation = Conversation::new(user_id, companion_id);
        index.conversations.push(conversation.clone());
        self.save_index(&index).await?;
        debug!(
            "Created conversation {} for user={} companion={}",
            conversation.id, user_id, companion_id
        );
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
        let _guard = self.lock.lock().await;
        Ok(self
            .read_pairs(conversation_id)
            .await?
            .into_iter()
            .flat_map(|p| [p.user, p.assistant])
            .collect())
    }

    async fn append_message_pair(
        &self,
        conversation_id: &str,
        user: &Message,
        assistant: &Message,
    ) -> Result<()> {
        self.append_pair(conversation_id, user, assistant, None).await
    }

    async fn append_message_pair_within(
        &self,
        conversation_id: &str,
        user: &Message,
        assistant: &Message,
        timeout: Duration,
    ) -> Result<()> {
        self.append_pair(conversation_id, user, assistant, Some(timeout))
            .await
    }
}
