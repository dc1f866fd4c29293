//! Process-local persistence backend.

use super::ledger::{ConversationLog, LedgerEvent, new_conversation};
use super::{ChatPersistence, NewMessage};
use crate::error::PersistenceError;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use mwplu_chat_protocol::{
    ChatMessage, Conversation, ConversationId, FinalizeTurnRequest, FinalizeTurnResult,
};
use parking_lot::RwLock;

/// Conversations kept in memory for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryPersistence {
    logs: RwLock<Vec<ConversationLog>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations ever created, active or not.
    pub fn conversation_count(&self) -> usize {
        self.logs.read().len()
    }
}

fn find_log<'a>(
    logs: &'a mut [ConversationLog],
    conversation_id: &str,
) -> Result<&'a mut ConversationLog, PersistenceError> {
    logs.iter_mut()
        .find(|log| log.id() == conversation_id)
        .ok_or_else(|| PersistenceError::NotFound(format!("conversation {conversation_id}")))
}

#[async_trait]
impl ChatPersistence for InMemoryPersistence {
    async fn active_conversation_id(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<ConversationId>, PersistenceError> {
        Ok(self
            .logs
            .read()
            .iter()
            .find(|log| log.is_active_for(user_id, document_id))
            .map(|log| log.conversation.id.clone()))
    }

    async fn get_or_create_conversation(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Conversation, PersistenceError> {
        let mut logs = self.logs.write();
        if let Some(log) = logs
            .iter()
            .find(|log| log.is_active_for(user_id, document_id))
        {
            return Ok(log.conversation.clone());
        }
        let conversation = new_conversation(user_id, document_id)?;
        debug!(
            "created conversation (conversation_id={}, document_id={})",
            conversation.id, document_id
        );
        logs.push(ConversationLog::new(conversation.clone()));
        Ok(conversation)
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, PersistenceError> {
        let logs = self.logs.read();
        logs.iter()
            .find(|log| log.id() == conversation_id)
            .map(|log| log.messages.clone())
            .ok_or_else(|| PersistenceError::NotFound(format!("conversation {conversation_id}")))
    }

    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, PersistenceError> {
        let mut logs = self.logs.write();
        let conversation_id = message.conversation_id.clone();
        let log = find_log(&mut logs, &conversation_id)?;
        let saved = log.prepare_message(message)?;
        log.record(LedgerEvent::MessageSaved {
            conversation_id,
            message: saved.clone(),
        });
        Ok(saved)
    }

    async fn finalize_turn(
        &self,
        request: &FinalizeTurnRequest,
    ) -> Result<FinalizeTurnResult, PersistenceError> {
        let mut logs = self.logs.write();
        let log = find_log(&mut logs, &request.conversation_id)?;
        let plan = log.prepare_finalize(request)?;
        if let Some(reply) = plan.reply {
            log.record(LedgerEvent::MessageSaved {
                conversation_id: request.conversation_id.clone(),
                message: reply,
            });
        }
        Ok(plan.result)
    }

    async fn deactivate_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<(), PersistenceError> {
        let mut logs = self.logs.write();
        let log = find_log(&mut logs, conversation_id)?;
        log.record(LedgerEvent::ConversationDeactivated {
            conversation_id: conversation_id.to_string(),
            deactivated_at: Utc::now(),
        });
        Ok(())
    }
}
