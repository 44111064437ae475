//! Retention policy configuration for conversation logs.

use anyhow::Result;
use serde::{Deserialize, Serialize};

// Default retention constants
const DEFAULT_HEADER_SIZE: u32 = 10;
const DEFAULT_WINDOW_SIZE: u32 = 50;
const DEFAULT_EVICTION_BATCH: u32 = 5;

/// Retention policy for a conversation log.
///
/// Turns with index `<= header_size` are permanent. The dialogue segment
/// (everything past the header) is bounded to `window_size` turns; when the
/// log reaches `header_size + window_size` total turns, the oldest
/// `eviction_batch` dialogue turns are evicted and the survivors renumbered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub header_size: u32,
    pub window_size: u32,
    pub eviction_batch: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            header_size: DEFAULT_HEADER_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            eviction_batch: DEFAULT_EVICTION_BATCH,
        }
    }
}

impl RetentionPolicy {
    /// Validate policy values
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(anyhow::anyhow!("Window size must be at least 1"));
        }

        if self.eviction_batch == 0 {
            return Err(anyhow::anyhow!("Eviction batch must be at least 1"));
        }

        if self.eviction_batch > self.window_size {
            return Err(anyhow::anyhow!(
                "Eviction batch ({}) must not exceed window size ({})",
                self.eviction_batch,
                self.window_size
            ));
        }

        Ok(())
    }

    /// Maximum number of turns a conversation may hold.
    pub fn capacity(&self) -> u32 {
        self.header_size + self.window_size
    }
}
