//! Sprachlog Storage - Low-level storage abstraction layer
//!
//! This crate provides the persistence layer for Sprachlog, using redb as
//! the embedded database. It exposes byte-level APIs; the typed conversation
//! log lives in the sprachlog-core crate.
//!
//! # Tables
//!
//! - `conversation_turns` - Turn payloads keyed by `(conversation_id, turn_index)`

pub mod policy;
pub mod turn;

use anyhow::Result;
use redb::Database;
use std::sync::Arc;

pub use policy::RetentionPolicy;
pub use turn::TurnStorage;

/// Central storage manager that initializes all storage subsystems
pub struct Storage {
    db: Arc<Database>,
    pub turns: TurnStorage,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will create the database file if it doesn't exist and initialize
    /// all required tables.
    pub fn new(path: &str) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);

        let turns = TurnStorage::new(db.clone())?;

        Ok(Self { db, turns })
    }

    /// Get a reference to the underlying database
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}
