//! Conversation checkpoints
//!
//! A checkpoint is the whole [`ConversationState`] of one conversation,
//! written after every step of a turn so an interrupted turn can resume.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::types::ConversationState;
use crate::core::FjallWrapper;
use crate::error::KbResult;

const CONVERSATION_PREFIX: &str = "conversation:";

/// Keyed store of conversation states
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, conversation: &str) -> KbResult<Option<ConversationState>>;

    /// Replace the stored state in a single write
    async fn save(&self, conversation: &str, state: &ConversationState) -> KbResult<()>;

    /// Returns whether a checkpoint existed
    async fn delete(&self, conversation: &str) -> KbResult<bool>;

    /// Ids of every stored conversation, sorted
    async fn list(&self) -> KbResult<Vec<String>>;
}

/// Process-local checkpoints
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, conversation: &str) -> KbResult<Option<ConversationState>> {
        Ok(self.states.read().await.get(conversation).cloned())
    }

    async fn save(&self, conversation: &str, state: &ConversationState) -> KbResult<()> {
        self.states
            .write()
            .await
            .insert(conversation.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, conversation: &str) -> KbResult<bool> {
        Ok(self.states.write().await.remove(conversation).is_some())
    }

    async fn list(&self) -> KbResult<Vec<String>> {
        let mut ids: Vec<String> = self.states.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    updated_at: u64,
    state: ConversationState,
}

/// Checkpoints persisted in a fjall keyspace
pub struct FjallCheckpointStore {
    db: FjallWrapper,
}

impl FjallCheckpointStore {
    pub fn open<P: AsRef<Path>>(path: P) -> KbResult<Self> {
        let db = FjallWrapper::with_partition(path, "checkpoints")?;
        Ok(Self { db })
    }

    fn key(conversation: &str) -> Vec<u8> {
        format!("{}{}", CONVERSATION_PREFIX, conversation).into_bytes()
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[async_trait]
impl CheckpointStore for FjallCheckpointStore {
    async fn load(&self, conversation: &str) -> KbResult<Option<ConversationState>> {
        let Some(bytes) = self.db.get(&Self::key(conversation))? else {
            return Ok(None);
        };
        let record: CheckpointRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to decode checkpoint for '{}'", conversation))?;
        Ok(Some(record.state))
    }

    async fn save(&self, conversation: &str, state: &ConversationState) -> KbResult<()> {
        let record = CheckpointRecord {
            updated_at: Self::current_timestamp(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.db.put(&Self::key(conversation), &bytes)?;
        self.db.flush()?;
        tracing::trace!(conversation, messages = state.len(), "saved checkpoint");
        Ok(())
    }

    async fn delete(&self, conversation: &str) -> KbResult<bool> {
        let key = Self::key(conversation);
        if self.db.get(&key)?.is_none() {
            return Ok(false);
        }
        self.db.delete(&key)?;
        self.db.flush()?;
        Ok(true)
    }

    async fn list(&self) -> KbResult<Vec<String>> {
        let mut ids = Vec::new();
        for (key, _) in self.db.scan_prefix(CONVERSATION_PREFIX.as_bytes())? {
            let key = String::from_utf8_lossy(&key);
            if let Some(id) = key.strip_prefix(CONVERSATION_PREFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

type LockMap = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// One async mutex per conversation.
///
/// Entries live only while a guard or a waiter holds them.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    locks: LockMap,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a conversation
    pub async fn acquire(&self, conversation: &str) -> ConversationGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(conversation.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        ConversationGuard {
            conversation: conversation.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Number of conversations currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one conversation; released on drop
#[derive(Debug)]
pub struct ConversationGuard {
    conversation: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.conversation)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.conversation);
        }
    }
}
