//! Sprachlog Core - bounded conversation log for a language-tutor chat service
//!
//! Maintains, per conversation, an ordered message history split into a
//! permanent header segment (onboarding/system turns) and a bounded rolling
//! dialogue window, and assembles that history into prompt context for a
//! text-generation client.
//!
//! # Architecture
//!
//! - [`log::ConversationLog`] - typed history with integrity checking,
//!   idempotent repair, per-conversation append serialization, and an
//!   optional bounded read cache
//! - [`llm`] - generation client trait plus a deterministic mock
//! - [`responder::Responder`] - persist-then-generate flow for one inbound
//!   message
//!
//! Persistence lives in the sprachlog-storage crate.

pub mod error;
pub mod llm;
pub mod log;
pub mod responder;

pub use error::{LogError, Result};
pub use llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Message, MockLlmClient,
    MockStep, Role, TokenUsage,
};
pub use log::{ConversationLog, ConversationTurn, HistoryCache, TurnRecord, assemble_prompt};
pub use responder::{GenerationParams, Responder};
pub use sprachlog_storage::{RetentionPolicy, Storage, TurnStorage};
