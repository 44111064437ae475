//! Responder - wires the conversation log to a text-generation client.
//!
//! The user turn is persisted before the generation call: a reply must
//! never be produced from context the store disagrees with, and a failed
//! generation must not lose the user's message.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{LogError, Result};
use crate::llm::{CompletionRequest, LlmClient, Message, Role};
use crate::log::{ConversationLog, assemble_prompt};

/// Opaque generation parameters forwarded to the client.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Produces one assistant reply per inbound user message.
pub struct Responder<C: LlmClient> {
    log: Arc<ConversationLog>,
    client: C,
    params: GenerationParams,
}

impl<C: LlmClient> Responder<C> {
    pub fn new(log: Arc<ConversationLog>, client: C) -> Self {
        Self {
            log,
            client,
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Handle one inbound user message and return the assistant reply.
    ///
    /// The prompt is the retained history plus the pending user turn. The
    /// user turn is persisted first; if generation then fails, the
    /// conversation keeps the user's message and the error propagates.
    pub async fn respond(
        &self,
        conversation_id: &str,
        user_text: &str,
        metadata: Value,
    ) -> Result<String> {
        let history = self.log.load_history(conversation_id)?;
        self.log
            .append_turn(conversation_id, Role::User, user_text, metadata)
            .await?;

        let messages = assemble_prompt(&history, Message::user(user_text));
        let mut request = CompletionRequest::new(messages);
        if let Some(temperature) = self.params.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.params.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.client.complete(request).await?;
        let reply = response
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LogError::Generation("model returned empty completion".to_string()))?;

        self.log
            .append_turn(conversation_id, Role::Assistant, &reply, Value::Null)
            .await?;

        debug!(
            conversation_id,
            provider = self.client.provider(),
            model = self.client.model(),
            "generated reply"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, MockStep};
    use sprachlog_storage::{RetentionPolicy, Storage};
    use tempfile::tempdir;

    fn test_responder(steps: Vec<MockStep>) -> (Responder<MockLlmClient>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.redb");
        let storage = Storage::new(path.to_str().unwrap()).unwrap();
        let log =
            Arc::new(ConversationLog::new(storage.turns, RetentionPolicy::default()).unwrap());
        let client = MockLlmClient::from_steps("mock-model", steps);
        (Responder::new(log.clone(), client), dir)
    }

    #[tokio::test]
    async fn test_respond_persists_both_turns() {
        let (responder, _dir) = test_responder(vec![MockStep::text("Sehr gut!")]);

        let reply = responder
            .respond("conv-1", "Ich habe Deutsch gelernt.", Value::Null)
            .await
            .unwrap();
        assert_eq!(reply, "Sehr gut!");

        let history = responder.log.load_history("conv-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "Ich habe Deutsch gelernt.");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Sehr gut!");
    }

    #[tokio::test]
    async fn test_generation_failure_keeps_user_turn() {
        let (responder, _dir) = test_responder(vec![MockStep::error("provider down")]);

        let result = responder.respond("conv-1", "Hallo?", Value::Null).await;
        assert!(matches!(result, Err(LogError::Generation(_))));

        // Conversation continuity: the user turn is already persisted.
        let history = responder.log.load_history("conv-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "Hallo?");
    }

    #[tokio::test]
    async fn test_empty_completion_is_a_generation_failure() {
        let (responder, _dir) = test_responder(vec![MockStep::text("  ")]);

        let result = responder.respond("conv-1", "Hallo?", Value::Null).await;
        assert!(matches!(result, Err(LogError::Generation(_))));

        let history = responder.log.load_history("conv-1").unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_turn_exchange() {
        let (responder, _dir) = test_responder(vec![
            MockStep::text("Hallo! Wie heißt du?"),
            MockStep::text("Freut mich, Anna!"),
        ]);

        responder.respond("conv-1", "Hallo!", Value::Null).await.unwrap();
        responder
            .respond("conv-1", "Ich heiße Anna.", Value::Null)
            .await
            .unwrap();

        let history = responder.log.load_history("conv-1").unwrap();
        assert_eq!(history.len(), 4);
        let indices: Vec<u32> = history.iter().map(|turn| turn.turn_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert_eq!(history[3].content, "Freut mich, Anna!");
    }
}
