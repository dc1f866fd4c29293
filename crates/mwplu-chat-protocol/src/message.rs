//! Chat message and conversation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a chat message, durable or temporary.
pub type MessageId = String;
/// Identifier of a conversation.
pub type ConversationId = String;

/// Prefix marking an optimistic, not-yet-durable message id.
pub const TEMP_ID_PREFIX: &str = "temp-";
/// Prefix marking a message that only exists client-side and will never be durable.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Speaker role for a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message typed by the user.
    User,
    /// Reply produced by the assistant (or an error rendered in its place).
    Assistant,
}

impl Role {
    /// Return the role as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("role must be either \"user\" or \"assistant\", got {other:?}")),
        }
    }
}

/// Free-form metadata attached to a message.
///
/// Only `reply_to_message_id` and `isError` carry meaning for turn handling;
/// any other keys are preserved untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// User message id this assistant reply answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<MessageId>,
    /// Marks an assistant entry that renders a failure.
    #[serde(default, rename = "isError", skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    /// Metadata linking a reply to the user message that triggered it.
    pub fn reply_to(message_id: impl Into<MessageId>) -> Self {
        Self {
            reply_to_message_id: Some(message_id.into()),
            ..Self::default()
        }
    }

    /// Metadata for an error entry.
    pub fn error() -> Self {
        Self {
            is_error: true,
            ..Self::default()
        }
    }

    /// Attach an extra metadata key.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single entry in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Durable id from the persistence layer, or a `temp-`/`local-` id.
    pub id: MessageId,
    /// Role that produced the message.
    pub role: Role,
    /// Message text.
    pub message: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// True while displayed optimistically before server confirmation.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_temporary: bool,
    /// Set when a reply arrived from the server without a prior temporary entry.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_newly_received: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a temporary message with a fresh `temp-` id.
    pub fn temporary(role: Role, message: impl Into<String>) -> Self {
        Self {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            role,
            message: message.into(),
            metadata: MessageMetadata::default(),
            is_temporary: true,
            is_newly_received: false,
            created_at: Utc::now(),
        }
    }

    /// Build a client-only message that is displayed but never persisted.
    pub fn local(role: Role, message: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()),
            role,
            message: message.into(),
            metadata,
            is_temporary: false,
            is_newly_received: false,
            created_at: Utc::now(),
        }
    }

    /// True when the id was assigned by the persistence layer.
    pub fn is_durable(&self) -> bool {
        !self.is_temporary
            && !self.id.starts_with(TEMP_ID_PREFIX)
            && !self.id.starts_with(LOCAL_ID_PREFIX)
    }

    /// True when this is an assistant reply to the given user message.
    pub fn is_reply_to(&self, user_message_id: &str) -> bool {
        self.role == Role::Assistant
            && self.metadata.reply_to_message_id.as_deref() == Some(user_message_id)
    }
}

/// Conversation scoped to one (user, document) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: String,
    pub document_id: String,
    /// Only one active conversation exists per (user, document).
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn role_parses_and_formats() {
        assert_eq!("user".parse::<Role>(), Ok(Role::User));
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));
        assert!("system".parse::<Role>().is_err());
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn metadata_reads_camel_case_error_flag_and_keeps_extra_keys() {
        let metadata: MessageMetadata = serde_json::from_value(json!({
            "isError": true,
            "reply_to_message_id": "m-1",
            "webhook_response": { "response": "hi" }
        }))
        .expect("metadata");
        assert!(metadata.is_error);
        assert_eq!(metadata.reply_to_message_id.as_deref(), Some("m-1"));
        assert_eq!(
            metadata.extra.get("webhook_response"),
            Some(&json!({ "response": "hi" }))
        );
    }

    #[test]
    fn server_row_without_local_flags_decodes_as_durable() {
        let message: ChatMessage = serde_json::from_value(json!({
            "id": "m-assist",
            "role": "assistant",
            "message": "Bonjour",
            "created_at": "2025-01-01T00:00:00Z"
        }))
        .expect("message");
        assert!(message.is_durable());
        assert!(!message.is_temporary);
        assert_eq!(message.metadata, MessageMetadata::default());
    }

    #[test]
    fn temporary_and_local_ids_are_not_durable() {
        let temp = ChatMessage::temporary(Role::Assistant, "...");
        assert!(temp.id.starts_with(TEMP_ID_PREFIX));
        assert!(!temp.is_durable());

        let local = ChatMessage::local(Role::Assistant, "oops", MessageMetadata::error());
        assert!(local.id.starts_with(LOCAL_ID_PREFIX));
        assert!(!local.is_durable());
        assert!(!local.is_temporary);
    }

    #[test]
    fn reply_matching_requires_assistant_role() {
        let mut message = ChatMessage::temporary(Role::User, "hi");
        message.metadata = MessageMetadata::reply_to("m-1");
        assert!(!message.is_reply_to("m-1"));
        message.role = Role::Assistant;
        assert!(message.is_reply_to("m-1"));
        assert!(!message.is_reply_to("m-2"));
    }
}
