//! Bounded in-memory history cache.
//!
//! A pure read optimization in front of the persistent store. Entries are
//! invalidated on every write to their conversation, and the store stays the
//! source of truth, so the log behaves identically with the cache disabled.

use dashmap::DashMap;
use std::time::Instant;

use crate::log::ConversationTurn;

#[derive(Debug, Clone)]
struct CachedHistory {
    turns: Vec<ConversationTurn>,
    inserted_at: Instant,
}

/// Bounded history cache keyed by conversation id
#[derive(Debug)]
pub struct HistoryCache {
    entries: DashMap<String, CachedHistory>,
    max_entries: usize,
}

impl HistoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached history, if present
    pub fn get(&self, conversation_id: &str) -> Option<Vec<ConversationTurn>> {
        self.entries
            .get(conversation_id)
            .map(|entry| entry.turns.clone())
    }

    /// Store a history, evicting the stalest entry when at capacity
    pub fn put(&self, conversation_id: &str, turns: Vec<ConversationTurn>) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(conversation_id) {
            let stalest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().inserted_at)
                .map(|entry| entry.key().clone());
            if let Some(key) = stalest {
                self.entries.remove(&key);
            }
        }

        self.entries.insert(
            conversation_id.to_string(),
            CachedHistory {
                turns,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop the cached history for a conversation
    pub fn invalidate(&self, conversation_id: &str) {
        self.entries.remove(conversation_id);
    }

    /// Drop all cached histories
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
