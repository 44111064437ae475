//! Error types for the conversation log service

use thiserror::Error;

/// Conversation log error types
#[derive(Error, Debug)]
pub enum LogError {
    #[error("user and assistant turns require non-empty content")]
    EmptyContent,

    #[error("integrity violation in conversation {conversation_id}: {detail}")]
    IntegrityViolation {
        conversation_id: String,
        detail: String,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for conversation log operations
pub type Result<T> = std::result::Result<T, LogError>;
