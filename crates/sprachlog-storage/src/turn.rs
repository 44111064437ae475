//! Conversation turn storage - byte-level API for bounded conversation logs.
//!
//! Turns are keyed by `(conversation_id, turn_index)` so that a range scan
//! yields one conversation's turns in index order. The append path runs the
//! eviction + renumbering maintenance pass and the insert inside a single
//! write transaction, so a half-renumbered window is never visible to
//! readers or left behind by a crash.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;
use tracing::debug;

use crate::policy::RetentionPolicy;

const TURNS_TABLE: TableDefinition<(&str, u32), &[u8]> =
    TableDefinition::new("conversation_turns");

/// Low-level conversation turn storage with byte-level API
#[derive(Debug, Clone)]
pub struct TurnStorage {
    db: Arc<Database>,
}

impl TurnStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(TURNS_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert raw turn data at an explicit index.
    ///
    /// Used for seeding header turns at setup time; the normal append path
    /// is [`TurnStorage::append_raw`], which assigns indices itself.
    pub fn insert_raw(&self, conversation_id: &str, turn_index: u32, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TURNS_TABLE)?;
            table.insert((conversation_id, turn_index), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List raw turns for a conversation, ascending by index, up to `limit`.
    pub fn list_raw(&self, conversation_id: &str, limit: usize) -> Result<Vec<(u32, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TURNS_TABLE)?;

        let mut turns = Vec::new();
        for item in table.range((conversation_id, 0u32)..=(conversation_id, u32::MAX))? {
            let (key, value) = item?;
            turns.push((key.value().1, value.value().to_vec()));
            if turns.len() >= limit {
                break;
            }
        }

        Ok(turns)
    }

    /// Count turns stored for a conversation.
    pub fn count(&self, conversation_id: &str) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TURNS_TABLE)?;

        let mut count = 0usize;
        for item in table.range((conversation_id, 0u32)..=(conversation_id, u32::MAX))? {
            item?;
            count += 1;
        }

        Ok(count)
    }

    /// Highest assigned turn index, or `None` for an empty conversation.
    pub fn max_index(&self, conversation_id: &str) -> Result<Option<u32>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TURNS_TABLE)?;

        let mut max = None;
        for item in table.range((conversation_id, 0u32)..=(conversation_id, u32::MAX))? {
            let (key, _) = item?;
            max = Some(key.value().1);
        }

        Ok(max)
    }

    /// Append a turn, running the maintenance pass first when the
    /// conversation is at capacity. Returns the assigned index.
    ///
    /// The maintenance pass evicts the oldest `eviction_batch` dialogue
    /// turns (header turns with index `<= header_size` are never
    /// candidates) and renumbers the survivors to a contiguous run starting
    /// at `header_size + 1`. Eviction, renumbering, and the insert commit
    /// as one transaction.
    pub fn append_raw(
        &self,
        conversation_id: &str,
        data: &[u8],
        policy: &RetentionPolicy,
    ) -> Result<u32> {
        policy.validate()?;

        let write_txn = self.db.begin_write()?;
        let assigned = {
            let mut table = write_txn.open_table(TURNS_TABLE)?;

            let mut turns: Vec<(u32, Vec<u8>)> = Vec::new();
            for item in table.range((conversation_id, 0u32)..=(conversation_id, u32::MAX))? {
                let (key, value) = item?;
                turns.push((key.value().1, value.value().to_vec()));
            }

            let capacity = policy.capacity() as usize;
            if turns.len() >= capacity {
                let header_size = policy.header_size;
                let split = turns
                    .iter()
                    .position(|(index, _)| *index > header_size)
                    .unwrap_or(turns.len());
                let dialogue = turns.split_off(split);

                // One batch suffices in normal operation; the overflow term
                // restores the capacity invariant if the log was ever left
                // over cap.
                let overflow = turns.len() + dialogue.len() + 1 - capacity;
                let evict = (policy.eviction_batch as usize)
                    .max(overflow)
                    .min(dialogue.len());

                for (index, _) in &dialogue {
                    table.remove((conversation_id, *index))?;
                }
                let survivors = &dialogue[evict..];
                for (offset, (_, payload)) in survivors.iter().enumerate() {
                    let new_index = header_size + 1 + offset as u32;
                    table.insert((conversation_id, new_index), payload.as_slice())?;
                }

                debug!(
                    conversation_id,
                    evicted = evict,
                    retained = survivors.len(),
                    "evicted oldest dialogue turns"
                );

                let next = header_size + survivors.len() as u32 + 1;
                table.insert((conversation_id, next), data)?;
                next
            } else {
                let next = turns.last().map(|(index, _)| index + 1).unwrap_or(1);
                table.insert((conversation_id, next), data)?;
                next
            }
        };
        write_txn.commit()?;
        Ok(assigned)
    }

    /// Idempotent repair pass for a log left with gapped dialogue indices
    /// by a failed maintenance pass.
    ///
    /// Re-sorts surviving dialogue turns by their old index and reassigns a
    /// contiguous run starting at `header_size + 1`, in one transaction.
    /// Returns the number of turns that changed index; an already-contiguous
    /// log is a no-op returning 0. Header turns are never touched, so a gap
    /// at or below `header_size` is not repairable here.
    pub fn repair(&self, conversation_id: &str, header_size: u32) -> Result<u32> {
        let write_txn = self.db.begin_write()?;
        let moved = {
            let mut table = write_txn.open_table(TURNS_TABLE)?;

            let mut dialogue: Vec<(u32, Vec<u8>)> = Vec::new();
            let range = (conversation_id, header_size + 1)..=(conversation_id, u32::MAX);
            for item in table.range(range)? {
                let (key, value) = item?;
                dialogue.push((key.value().1, value.value().to_vec()));
            }

            let mut moved = 0u32;
            for (offset, (old_index, payload)) in dialogue.iter().enumerate() {
                let new_index = header_size + 1 + offset as u32;
                // Ascending order guarantees new_index <= old_index, so the
                // target slot is already vacated.
                if new_index != *old_index {
                    table.remove((conversation_id, *old_index))?;
                    table.insert((conversation_id, new_index), payload.as_slice())?;
                    moved += 1;
                }
            }
            moved
        };
        write_txn.commit()?;

        if moved > 0 {
            debug!(conversation_id, moved, "repaired dialogue turn indices");
        }
        Ok(moved)
    }

    /// Delete all turns for a conversation. Returns the number removed.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TURNS_TABLE)?;

            let mut indices = Vec::new();
            for item in table.range((conversation_id, 0u32)..=(conversation_id, u32::MAX))? {
                let (key, _) = item?;
                indices.push(key.value().1);
            }

            for index in &indices {
                table.remove((conversation_id, *index))?;
            }
            indices.len() as u64
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Returns both the store and the TempDir to ensure the directory
    /// is not deleted while the store is in use.
    fn test_store() -> (TurnStorage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("turns.redb");
        let db = Arc::new(Database::create(db_path).unwrap());
        (TurnStorage::new(db).unwrap(), dir)
    }

    fn small_policy() -> RetentionPolicy {
        RetentionPolicy {
            header_size: 2,
            window_size: 4,
            eviction_batch: 2,
        }
    }

    #[test]
    fn test_append_assigns_contiguous_indices() {
        let (store, _dir) = test_store();
        let policy = RetentionPolicy::default();

        for i in 1..=5u32 {
            let assigned = store
                .append_raw("conv-1", format!("turn-{i}").as_bytes(), &policy)
                .unwrap();
            assert_eq!(assigned, i);
        }

        let turns = store.list_raw("conv-1", 100).unwrap();
        let indices: Vec<u32> = turns.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let (store, _dir) = test_store();
        let policy = RetentionPolicy::default();

        store.append_raw("conv-1", b"first", &policy).unwrap();
        store.append_raw("conv-1", b"second", &policy).unwrap();
        store.append_raw("conv-1", b"third", &policy).unwrap();

        let turns = store.list_raw("conv-1", 100).unwrap();
        let contents: Vec<&[u8]> = turns.iter().map(|(_, data)| data.as_slice()).collect();
        assert_eq!(contents, vec![b"first" as &[u8], b"second", b"third"]);
    }

    #[test]
    fn test_empty_conversation() {
        let (store, _dir) = test_store();

        assert!(store.list_raw("conv-1", 100).unwrap().is_empty());
        assert_eq!(store.count("conv-1").unwrap(), 0);
        assert_eq!(store.max_index("conv-1").unwrap(), None);
    }

    #[test]
    fn test_conversations_are_isolated() {
        let (store, _dir) = test_store();
        let policy = RetentionPolicy::default();

        store.append_raw("conv-a", b"a1", &policy).unwrap();
        store.append_raw("conv-b", b"b1", &policy).unwrap();
        store.append_raw("conv-a", b"a2", &policy).unwrap();

        assert_eq!(store.count("conv-a").unwrap(), 2);
        assert_eq!(store.count("conv-b").unwrap(), 1);
        assert_eq!(store.max_index("conv-b").unwrap(), Some(1));
    }

    #[test]
    fn test_eviction_at_capacity() {
        // HEADER_SIZE=10, WINDOW_SIZE=50, EVICTION_BATCH=5: appending the
        // 61st turn deletes 11-15, renumbers old 16-60 to 11-55, and assigns
        // index 56 to the new turn.
        let (store, _dir) = test_store();
        let policy = RetentionPolicy::default();

        for i in 1..=10u32 {
            store
                .insert_raw("conv-1", i, format!("header-{i}").as_bytes())
                .unwrap();
        }
        for i in 1..=50u32 {
            let assigned = store
                .append_raw("conv-1", format!("dialogue-{i}").as_bytes(), &policy)
                .unwrap();
            assert_eq!(assigned, 10 + i);
        }
        assert_eq!(store.count("conv-1").unwrap(), 60);

        let assigned = store.append_raw("conv-1", b"dialogue-51", &policy).unwrap();
        assert_eq!(assigned, 56);
        assert_eq!(store.count("conv-1").unwrap(), 56);

        let turns = store.list_raw("conv-1", 100).unwrap();
        // Header intact.
        assert_eq!(turns[0], (1, b"header-1".to_vec()));
        assert_eq!(turns[9], (10, b"header-10".to_vec()));
        // Old turn 16 (dialogue-6) is now index 11; dialogue-1..5 evicted.
        assert_eq!(turns[10], (11, b"dialogue-6".to_vec()));
        assert_eq!(turns[54], (55, b"dialogue-50".to_vec()));
        assert_eq!(turns[55], (56, b"dialogue-51".to_vec()));
    }

    #[test]
    fn test_header_survives_many_appends() {
        let (store, _dir) = test_store();
        let policy = small_policy();

        store.insert_raw("conv-1", 1, b"header-1").unwrap();
        store.insert_raw("conv-1", 2, b"header-2").unwrap();

        // 10x the window size of appends.
        for i in 1..=40u32 {
            store
                .append_raw("conv-1", format!("dialogue-{i}").as_bytes(), &policy)
                .unwrap();
            assert!(store.count("conv-1").unwrap() <= policy.capacity() as usize);
        }

        let turns = store.list_raw("conv-1", 100).unwrap();
        assert_eq!(turns[0], (1, b"header-1".to_vec()));
        assert_eq!(turns[1], (2, b"header-2".to_vec()));
        // Most recent turn is always present.
        assert_eq!(turns.last().unwrap().1, b"dialogue-40".to_vec());
    }

    #[test]
    fn test_relative_order_preserved_across_eviction() {
        let (store, _dir) = test_store();
        let policy = small_policy();

        store.insert_raw("conv-1", 1, b"h1").unwrap();
        store.insert_raw("conv-1", 2, b"h2").unwrap();
        for i in 1..=4u32 {
            store
                .append_raw("conv-1", format!("d{i}").as_bytes(), &policy)
                .unwrap();
        }

        // At capacity (6): next append evicts d1 and d2.
        let assigned = store.append_raw("conv-1", b"d5", &policy).unwrap();
        assert_eq!(assigned, 5);

        let turns = store.list_raw("conv-1", 100).unwrap();
        let contents: Vec<&[u8]> = turns.iter().map(|(_, data)| data.as_slice()).collect();
        assert_eq!(
            contents,
            vec![b"h1" as &[u8], b"h2", b"d3", b"d4", b"d5"]
        );
        let indices: Vec<u32> = turns.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_repair_closes_dialogue_gap() {
        let (store, _dir) = test_store();

        store.insert_raw("conv-1", 1, b"h1").unwrap();
        store.insert_raw("conv-1", 2, b"h2").unwrap();
        // Gap at 5 simulates a maintenance pass that failed mid-renumber.
        store.insert_raw("conv-1", 3, b"d1").unwrap();
        store.insert_raw("conv-1", 4, b"d2").unwrap();
        store.insert_raw("conv-1", 6, b"d3").unwrap();
        store.insert_raw("conv-1", 7, b"d4").unwrap();

        let moved = store.repair("conv-1", 2).unwrap();
        assert_eq!(moved, 2);

        let turns = store.list_raw("conv-1", 100).unwrap();
        let indices: Vec<u32> = turns.iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(turns[4], (5, b"d3".to_vec()));
        assert_eq!(turns[5], (6, b"d4".to_vec()));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let (store, _dir) = test_store();

        store.insert_raw("conv-1", 1, b"h1").unwrap();
        store.insert_raw("conv-1", 3, b"d1").unwrap();
        store.insert_raw("conv-1", 5, b"d2").unwrap();

        let first = store.repair("conv-1", 1).unwrap();
        assert_eq!(first, 2);
        let snapshot = store.list_raw("conv-1", 100).unwrap();

        let second = store.repair("conv-1", 1).unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.list_raw("conv-1", 100).unwrap(), snapshot);
    }

    #[test]
    fn test_delete_conversation() {
        let (store, _dir) = test_store();
        let policy = RetentionPolicy::default();

        store.append_raw("conv-1", b"one", &policy).unwrap();
        store.append_raw("conv-1", b"two", &policy).unwrap();
        store.append_raw("conv-2", b"other", &policy).unwrap();

        let removed = store.delete_conversation("conv-1").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("conv-1").unwrap(), 0);
        assert_eq!(store.count("conv-2").unwrap(), 1);
    }

    #[test]
    fn test_invalid_policy_rejected_on_append() {
        let (store, _dir) = test_store();
        let policy = RetentionPolicy {
            window_size: 0,
            ..Default::default()
        };

        assert!(store.append_raw("conv-1", b"turn", &policy).is_err());
    }
}
