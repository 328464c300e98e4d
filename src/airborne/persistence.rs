//! Persistence collaborator (§6): `PersistConversationTurnWithDebug(...)`, creating the thread
//! row if absent. The conversation-history database schema itself is an external collaborator;
//! this module defines only the contract the orchestrator (C12) calls into, plus an in-memory
//! reference implementation for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct TurnDebug {
    pub system_prompt: Option<String>,
    pub raw_request: Option<serde_json::Value>,
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub thread_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub user_content: String,
    pub assistant_content: String,
    pub provider: String,
    pub model: String,
    pub response_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub processing_ms: u64,
    pub cost_usd: f64,
    pub debug: TurnDebug,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceCollaborator: Send + Sync {
    /// Persist one (user, assistant) turn, creating the thread row if it doesn't exist yet.
    #[allow(clippy::too_many_arguments)]
    async fn persist_conversation_turn_with_debug(
        &self,
        thread_id: &str,
        tenant_id: &str,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
        provider: &str,
        model: &str,
        response_id: Option<&str>,
        input_tokens: u64,
        output_tokens: u64,
        processing_ms: u64,
        cost_usd: f64,
        debug: TurnDebug,
    ) -> Result<(), String>;
}

/// In-memory reference implementation; a real deployment backs this with its own conversation
/// store (out of scope here — see the contract above).
pub struct InMemoryPersistence {
    threads: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        InMemoryPersistence { threads: Mutex::new(HashMap::new()) }
    }

    pub fn turns_for(&self, thread_id: &str) -> Vec<ConversationTurn> {
        self.threads.lock().unwrap().get(thread_id).cloned().unwrap_or_default()
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceCollaborator for InMemoryPersistence {
    async fn persist_conversation_turn_with_debug(
        &self,
        thread_id: &str,
        tenant_id: &str,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
        provider: &str,
        model: &str,
        response_id: Option<&str>,
        input_tokens: u64,
        output_tokens: u64,
        processing_ms: u64,
        cost_usd: f64,
        debug: TurnDebug,
    ) -> Result<(), String> {
        let turn = ConversationTurn {
            thread_id: thread_id.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            user_content: user_content.to_string(),
            assistant_content: assistant_content.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            response_id: response_id.map(|s| s.to_string()),
            input_tokens,
            output_tokens,
            processing_ms,
            cost_usd,
            debug,
            recorded_at: Utc::now(),
        };
        self.threads
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_insert_with(Vec::new)
            .push(turn);
        Ok(())
    }
}
