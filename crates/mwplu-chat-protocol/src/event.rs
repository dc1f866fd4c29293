//! Store events emitted so a UI can re-render.

use crate::message::{ChatMessage, ConversationId, MessageId};
use serde::{Deserialize, Serialize};

/// Change notifications for the in-memory conversation view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum ChatEvent {
    /// A message was appended at the end of the list.
    MessageAppended { message: ChatMessage },
    /// A temporary message's text or flags changed in place.
    MessageUpdated { message: ChatMessage },
    /// The entry at `previous_id` now holds `message`, same position.
    MessageReplaced {
        previous_id: MessageId,
        message: ChatMessage,
    },
    /// An entry was removed.
    MessageRemoved { id: MessageId },
    /// The durable view was refreshed from the server.
    MessagesReloaded {
        conversation_id: Option<ConversationId>,
        count: usize,
    },
    /// Streaming started or stopped.
    StreamingChanged { streaming: bool },
    /// A turn reached a terminal state.
    TurnCompleted {
        user_message_id: Option<MessageId>,
        success: bool,
    },
}

/// Sink interface for chat store events.
///
/// Events are delivered after the emitting session has released its state
/// lock, in the order the mutations happened.
pub trait EventSink: Send + Sync {
    /// Emit an event to downstream listeners.
    fn emit(&self, event: ChatEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ChatEvent) {}
}
