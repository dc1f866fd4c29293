//! Durable storage for conversations and messages.

mod jsonl;
mod ledger;
mod memory;

pub use jsonl::JsonlPersistence;
pub use memory::InMemoryPersistence;

use crate::error::PersistenceError;
use async_trait::async_trait;
use mwplu_chat_protocol::{
    ChatMessage, Conversation, ConversationId, FinalizeTurnRequest, FinalizeTurnResult,
    MessageMetadata, Role,
};

/// Message to be written durably.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub document_id: String,
    pub role: Role,
    pub message: String,
    pub metadata: MessageMetadata,
}

/// Persistence collaborator used by chat sessions.
///
/// `finalize_turn` must be idempotent: repeated calls for the same user
/// message return the reply written by the first call.
#[async_trait]
pub trait ChatPersistence: Send + Sync {
    /// Active conversation for the pair, if any.
    async fn active_conversation_id(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<ConversationId>, PersistenceError>;

    /// Return the active conversation for the pair, creating one when absent.
    async fn get_or_create_conversation(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Conversation, PersistenceError>;

    /// Messages of a conversation in insertion order.
    async fn get_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, PersistenceError>;

    /// Persist one message and return its durable form.
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, PersistenceError>;

    /// Guarantee exactly one durable assistant reply for the user message.
    async fn finalize_turn(
        &self,
        request: &FinalizeTurnRequest,
    ) -> Result<FinalizeTurnResult, PersistenceError>;

    /// Mark a conversation inactive so the next turn starts a new one.
    async fn deactivate_conversation(&self, conversation_id: &str)
    -> Result<(), PersistenceError>;
}
