//! Bounded conversation log.
//!
//! Each conversation keeps a permanent header segment (turn indices
//! `1..=header_size`, typically onboarding and system instructions) and a
//! rolling dialogue window bounded by the retention policy. Appends run the
//! eviction + renumbering maintenance pass in the storage layer when the
//! log is at capacity; this module adds the typed record format, integrity
//! checking with idempotent repair, per-conversation append serialization,
//! and prompt assembly for the generation client.

pub mod cache;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sprachlog_storage::{RetentionPolicy, TurnStorage};

use crate::error::{LogError, Result};
use crate::llm::{Message, Role};

pub use cache::HistoryCache;

/// Persisted turn payload (JSON bytes in the turn store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// One turn of a conversation, addressed by its index.
///
/// Ordering authority is `turn_index`; `created_at` is informational only.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub conversation_id: String,
    pub turn_index: u32,
    pub role: Role,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Capacity-bounded, per-conversation message history.
pub struct ConversationLog {
    storage: TurnStorage,
    policy: RetentionPolicy,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cache: Option<HistoryCache>,
}

impl ConversationLog {
    pub fn new(storage: TurnStorage, policy: RetentionPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            storage,
            policy,
            locks: DashMap::new(),
            cache: None,
        })
    }

    /// Enable the bounded read cache.
    ///
    /// Purely an optimization; the store remains the source of truth and
    /// every write invalidates the conversation's entry.
    pub fn with_cache(mut self, max_entries: usize) -> Self {
        self.cache = Some(HistoryCache::new(max_entries));
        self
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Load the full retained history, ordered by turn index.
    ///
    /// An unknown conversation yields an empty list, not an error. A gapped
    /// index sequence (the footprint of a failed maintenance pass) triggers
    /// the idempotent repair pass and a reload; if the sequence is still
    /// malformed the load fails with [`LogError::IntegrityViolation`] rather
    /// than assembling a malformed prompt context.
    pub fn load_history(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(conversation_id)
        {
            return Ok(hit);
        }

        let mut turns = self.fetch(conversation_id)?;
        if let Some(detail) = sequence_gap(&turns) {
            warn!(
                conversation_id,
                %detail,
                "turn index sequence malformed, running repair pass"
            );
            self.storage
                .repair(conversation_id, self.policy.header_size)?;
            turns = self.fetch(conversation_id)?;
            if let Some(detail) = sequence_gap(&turns) {
                return Err(LogError::IntegrityViolation {
                    conversation_id: conversation_id.to_string(),
                    detail,
                });
            }
        }

        if let Some(cache) = &self.cache {
            cache.put(conversation_id, turns.clone());
        }
        Ok(turns)
    }

    /// Append a turn, returning the assigned index.
    ///
    /// User and assistant turns require non-empty content. The append and
    /// any maintenance pass it triggers are serialized per conversation;
    /// appends for different conversations proceed independently.
    pub async fn append_turn(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        metadata: Value,
    ) -> Result<u32> {
        if content.trim().is_empty() && role != Role::System {
            return Err(LogError::EmptyContent);
        }

        let record = TurnRecord {
            role,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        let data = serde_json::to_vec(&record)?;

        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let assigned = self
            .storage
            .append_raw(conversation_id, &data, &self.policy)?;
        if let Some(cache) = &self.cache {
            cache.invalidate(conversation_id);
        }

        debug!(conversation_id, turn_index = assigned, "appended turn");
        Ok(assigned)
    }

    /// Seed header turns for a new conversation at setup time.
    ///
    /// Fails if the conversation already has turns or if more turns are
    /// given than the header segment holds.
    pub async fn seed_header(&self, conversation_id: &str, turns: &[Message]) -> Result<u32> {
        if turns.len() > self.policy.header_size as usize {
            return Err(LogError::Store(anyhow::anyhow!(
                "{} header turns exceed header size {}",
                turns.len(),
                self.policy.header_size
            )));
        }

        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        if self.storage.count(conversation_id)? > 0 {
            return Err(LogError::Store(anyhow::anyhow!(
                "conversation {conversation_id} already has turns"
            )));
        }

        for (offset, message) in turns.iter().enumerate() {
            let record = TurnRecord {
                role: message.role.clone(),
                content: message.content.clone(),
                metadata: Value::Null,
                created_at: Utc::now(),
            };
            let data = serde_json::to_vec(&record)?;
            self.storage
                .insert_raw(conversation_id, offset as u32 + 1, &data)?;
        }

        if let Some(cache) = &self.cache {
            cache.invalidate(conversation_id);
        }
        Ok(turns.len() as u32)
    }

    /// Run the repair pass explicitly. Returns the number of turns moved.
    pub async fn repair(&self, conversation_id: &str) -> Result<u32> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let moved = self
            .storage
            .repair(conversation_id, self.policy.header_size)?;
        if let Some(cache) = &self.cache {
            cache.invalidate(conversation_id);
        }
        Ok(moved)
    }

    fn fetch(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        let limit = self.policy.capacity() as usize;
        let raw = self.storage.list_raw(conversation_id, limit)?;

        raw.into_iter()
            .map(|(turn_index, data)| {
                let record: TurnRecord = serde_json::from_slice(&data)?;
                Ok(ConversationTurn {
                    conversation_id: conversation_id.to_string(),
                    turn_index,
                    role: record.role,
                    content: record.content,
                    metadata: record.metadata,
                    created_at: record.created_at,
                })
            })
            .collect()
    }
}

/// Assemble the message list for a generation call: header turns in order,
/// dialogue turns in order, then the pending turn last.
pub fn assemble_prompt(history: &[ConversationTurn], pending: Message) -> Vec<Message> {
    let mut messages: Vec<Message> = history
        .iter()
        .map(|turn| Message {
            role: turn.role.clone(),
            content: turn.content.clone(),
        })
        .collect();
    messages.push(pending);
    messages
}

/// Check that turn indices form a contiguous run starting at 1.
fn sequence_gap(turns: &[ConversationTurn]) -> Option<String> {
    for (offset, turn) in turns.iter().enumerate() {
        let expected = offset as u32 + 1;
        if turn.turn_index != expected {
            return Some(format!(
                "expected turn index {expected}, found {}",
                turn.turn_index
            ));
        }
    }
    None
}
