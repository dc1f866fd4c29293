//! Webhook request body, NDJSON stream events, and finalize-turn RPC shapes.

use crate::message::{ConversationId, MessageId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body POSTed to the chat webhook, once per user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookRequest {
    /// Durable id of the user message; the turn's correlation key.
    pub message_id: MessageId,
    pub message: String,
    pub document_id: String,
    pub user_id: String,
    /// Serialized as `null` when no conversation exists yet.
    pub conversation_id: Option<ConversationId>,
}

/// One line of an NDJSON webhook stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Begin {
        #[serde(default)]
        metadata: Option<Value>,
    },
    /// Carries a content delta.
    Item {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    End {
        #[serde(default)]
        metadata: Option<Value>,
    },
}

impl StreamEvent {
    /// Non-empty content delta carried by an `item` event.
    pub fn delta(&self) -> Option<&str> {
        match self {
            StreamEvent::Item {
                content: Some(content),
                ..
            } if !content.is_empty() => Some(content),
            _ => None,
        }
    }
}

/// Arguments of the idempotent finalize-turn RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizeTurnRequest {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub document_id: String,
    /// Key of the idempotency guarantee.
    pub user_message_id: MessageId,
    pub ai_text: String,
}

/// Result of the finalize-turn RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizeTurnResult {
    /// Id of the single durable assistant reply for the turn.
    pub assistant_message_id: MessageId,
    /// 1-based index of the turn within the conversation.
    pub conversation_turn: u32,
}
