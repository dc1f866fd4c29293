//! Conversation log shared by the persistence backends.
//!
//! Backends compute the next [`LedgerEvent`] from the current log, store it,
//! then apply it. The JSONL store writes the same events one per line.

use super::NewMessage;
use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use mwplu_chat_protocol::{
    ChatMessage, Conversation, ConversationId, FinalizeTurnRequest, FinalizeTurnResult,
    MessageMetadata, Role,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum LedgerEvent {
    SchemaVersion {
        version: u32,
    },
    ConversationCreated {
        conversation: Conversation,
    },
    MessageSaved {
        conversation_id: ConversationId,
        message: ChatMessage,
    },
    ConversationDeactivated {
        conversation_id: ConversationId,
        deactivated_at: DateTime<Utc>,
    },
}

/// One conversation and its messages.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConversationLog {
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
}

/// Outcome of planning a finalize call.
pub(crate) struct FinalizePlan {
    pub result: FinalizeTurnResult,
    /// Reply to write; `None` when one already exists.
    pub reply: Option<ChatMessage>,
}

impl ConversationLog {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    pub fn is_active_for(&self, user_id: &str, document_id: &str) -> bool {
        self.conversation.is_active
            && self.conversation.user_id == user_id
            && self.conversation.document_id == document_id
    }

    /// Apply a message or deactivation event.
    pub fn record(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::MessageSaved { message, .. } => {
                self.conversation.last_message_at = Some(message.created_at);
                self.messages.push(message);
            }
            LedgerEvent::ConversationDeactivated { .. } => {
                self.conversation.is_active = false;
            }
            LedgerEvent::SchemaVersion { .. } | LedgerEvent::ConversationCreated { .. } => {}
        }
    }

    /// Durable form of a message about to be saved.
    pub fn prepare_message(&self, message: NewMessage) -> Result<ChatMessage, PersistenceError> {
        let text = message.message.trim();
        if text.is_empty() {
            return Err(PersistenceError::InvalidInput(
                "message content must not be empty".to_string(),
            ));
        }
        Ok(ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: message.role,
            message: text.to_string(),
            metadata: message.metadata,
            is_temporary: false,
            is_newly_received: false,
            created_at: Utc::now(),
        })
    }

    /// Plan a finalize call; an existing reply is returned instead of a new one.
    pub fn prepare_finalize(
        &self,
        request: &FinalizeTurnRequest,
    ) -> Result<FinalizePlan, PersistenceError> {
        let conversation_turn = self.turn_number(&request.user_message_id).ok_or_else(|| {
            PersistenceError::NotFound(format!("user message {}", request.user_message_id))
        })?;
        if let Some(existing) = self
            .messages
            .iter()
            .find(|message| message.is_reply_to(&request.user_message_id))
        {
            return Ok(FinalizePlan {
                result: FinalizeTurnResult {
                    assistant_message_id: existing.id.clone(),
                    conversation_turn,
                },
                reply: None,
            });
        }
        let reply = self.prepare_message(NewMessage {
            conversation_id: self.conversation.id.clone(),
            user_id: request.user_id.clone(),
            document_id: request.document_id.clone(),
            role: Role::Assistant,
            message: request.ai_text.clone(),
            metadata: MessageMetadata::reply_to(request.user_message_id.clone()),
        })?;
        Ok(FinalizePlan {
            result: FinalizeTurnResult {
                assistant_message_id: reply.id.clone(),
                conversation_turn,
            },
            reply: Some(reply),
        })
    }

    /// 1-based index of the user message among the conversation's user messages.
    fn turn_number(&self, user_message_id: &str) -> Option<u32> {
        let mut turn = 0;
        for message in &self.messages {
            if message.role == Role::User {
                turn += 1;
                if message.id == user_message_id {
                    return Some(turn);
                }
            }
        }
        None
    }
}

/// Fresh active conversation for the pair.
pub(crate) fn new_conversation(
    user_id: &str,
    document_id: &str,
) -> Result<Conversation, PersistenceError> {
    if user_id.trim().is_empty() || document_id.trim().is_empty() {
        return Err(PersistenceError::InvalidInput(
            "conversation requires a user and a document".to_string(),
        ));
    }
    Ok(Conversation {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        document_id: document_id.to_string(),
        is_active: true,
        created_at: Utc::now(),
        last_message_at: None,
    })
}

/// Rebuilds a [`ConversationLog`] from its event sequence.
#[derive(Default)]
pub(crate) struct Replay {
    version: Option<u32>,
    log: Option<ConversationLog>,
}

impl Replay {
    pub fn apply(&mut self, event: LedgerEvent) -> Result<(), PersistenceError> {
        match event {
            LedgerEvent::SchemaVersion { version } => {
                if version > SCHEMA_VERSION {
                    return Err(PersistenceError::UnsupportedSchema(version));
                }
                self.version = Some(version);
            }
            LedgerEvent::ConversationCreated { conversation } => {
                self.log = Some(ConversationLog::new(conversation));
            }
            other => {
                if let Some(log) = self.log.as_mut() {
                    log.record(other);
                }
            }
        }
        Ok(())
    }

    pub fn finish(self, source: &str) -> Result<ConversationLog, PersistenceError> {
        match (self.version, self.log) {
            (Some(_), Some(log)) => Ok(log),
            _ => Err(PersistenceError::MissingMetadata(source.to_string())),
        }
    }
}
