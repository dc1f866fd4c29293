//! Ordered in-memory view of one conversation's messages.
//!
//! The store keeps two invariants across every operation: no two entries share
//! an id, and at most one assistant entry exists per `reply_to_message_id`.
//! Inserting a message that collides with either rule replaces the existing
//! entry at its position instead of appending.

use log::debug;
use mwplu_chat_protocol::{ChatEvent, ChatMessage, ConversationId, MessageId, MessageMetadata, Role};

/// Message list with temporary/durable lifecycle handling.
///
/// Mutations queue a [`ChatEvent`] each; the owner drains them with
/// [`MessageStore::take_events`] once it no longer holds any lock on the store.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    pending: Vec<ChatEvent>,
}

/// Where a client-only entry sat relative to its neighbours before a reload.
#[derive(Debug)]
struct Anchor {
    after: Option<MessageId>,
    after_reply_to: Option<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events queued since the last call, in mutation order.
    pub fn take_events(&mut self) -> Vec<ChatEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Assistant entry answering the given user message, if displayed.
    pub fn find_reply(&self, user_message_id: &str) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .find(|message| message.is_reply_to(user_message_id))
    }

    /// Append a message, replacing in place any entry it supersedes.
    pub fn push(&mut self, message: ChatMessage) {
        match self.conflicting_index(&message) {
            Some(index) => {
                let previous_id = std::mem::replace(&mut self.messages[index], message.clone()).id;
                self.drop_other_conflicts(index);
                debug!(
                    "replaced conflicting entry (previous_id={}, id={})",
                    previous_id, message.id
                );
                self.pending.push(ChatEvent::MessageReplaced {
                    previous_id,
                    message,
                });
            }
            None => {
                self.messages.push(message.clone());
                self.pending.push(ChatEvent::MessageAppended { message });
            }
        }
    }

    /// Create and append a temporary message with a fresh `temp-` id.
    pub fn add_temporary_message(&mut self, role: Role, content: &str) -> ChatMessage {
        self.add_temporary_message_with(role, content, MessageMetadata::default())
    }

    /// Create and append a temporary message carrying metadata.
    pub fn add_temporary_message_with(
        &mut self,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) -> ChatMessage {
        let mut message = ChatMessage::temporary(role, content);
        message.metadata = metadata;
        self.push(message.clone());
        message
    }

    /// Overwrite a temporary message's text. No-op unless the entry is temporary.
    pub fn update_temporary_message_content(&mut self, id: &str, content: &str) -> bool {
        self.mutate_temporary(id, |message| message.message = content.to_string())
    }

    /// Append a delta to a temporary message's text. No-op unless temporary.
    pub fn append_to_temporary_message(&mut self, id: &str, delta: &str) -> bool {
        self.mutate_temporary(id, |message| message.message.push_str(delta))
    }

    /// Swap a temporary entry for its durable counterpart at the same position.
    ///
    /// Returns false, leaving the list untouched, when `temp_id` is not present.
    pub fn replace_temporary_message(&mut self, temp_id: &str, durable: ChatMessage) -> bool {
        let Some(index) = self.index_of(temp_id) else {
            return false;
        };
        self.messages[index] = durable.clone();
        self.drop_other_conflicts(index);
        self.pending.push(ChatEvent::MessageReplaced {
            previous_id: temp_id.to_string(),
            message: durable,
        });
        true
    }

    /// Delete a temporary entry. Durable entries are never removed this way.
    pub fn remove_temporary_message(&mut self, temp_id: &str) -> bool {
        let Some(index) = self
            .messages
            .iter()
            .position(|message| message.id == temp_id && message.is_temporary)
        else {
            return false;
        };
        self.messages.remove(index);
        self.pending.push(ChatEvent::MessageRemoved {
            id: temp_id.to_string(),
        });
        true
    }

    /// Keep a temporary entry as final without a durable counterpart.
    pub fn confirm_temporary_message(&mut self, temp_id: &str) -> bool {
        self.mutate_temporary(temp_id, |message| message.is_temporary = false)
    }

    /// Replace the durable view with a server listing, keeping client-only entries.
    ///
    /// Temporary and local entries survive unless the listing already holds
    /// the same id or a reply to the same user message. A surviving reply goes
    /// back after the user message it answers; any other entry goes back after
    /// the entry it followed before the reload.
    pub fn sync_durable(
        &mut self,
        conversation_id: Option<&ConversationId>,
        server: Vec<ChatMessage>,
    ) {
        let mut client_only = Vec::new();
        let mut previous: Option<&ChatMessage> = None;
        for message in &self.messages {
            if !message.is_durable() {
                client_only.push((anchor_for(message, previous), message.clone()));
            }
            previous = Some(message);
        }

        self.messages.clear();
        for message in server {
            self.insert_silently(message);
        }
        for (anchor, message) in client_only {
            if self.conflicting_index(&message).is_some() {
                continue;
            }
            let index = self.resolve(&anchor);
            self.messages.insert(index, message);
        }
        self.pending.push(ChatEvent::MessagesReloaded {
            conversation_id: conversation_id.cloned(),
            count: self.messages.len(),
        });
    }

    /// Flag a reply that arrived without a prior temporary entry.
    pub fn mark_newly_received(&mut self, id: &str) -> bool {
        let Some(message) = self.messages.iter_mut().find(|message| message.id == id) else {
            return false;
        };
        message.is_newly_received = true;
        let message = message.clone();
        self.pending.push(ChatEvent::MessageUpdated { message });
        true
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        let count = self.messages.len();
        self.messages.clear();
        if count > 0 {
            self.pending.push(ChatEvent::MessagesReloaded {
                conversation_id: None,
                count: 0,
            });
        }
    }

    fn insert_silently(&mut self, message: ChatMessage) {
        match self.conflicting_index(&message) {
            Some(index) => {
                self.messages[index] = message;
                self.drop_other_conflicts(index);
            }
            None => self.messages.push(message),
        }
    }

    /// Insertion index for a re-attached client entry.
    ///
    /// Client entries already re-attached at the same spot are skipped so they
    /// keep their relative order.
    fn resolve(&self, anchor: &Anchor) -> usize {
        let mut index = match &anchor.after {
            None => 0,
            Some(id) => match self.index_of(id).or_else(|| {
                let reply_to = anchor.after_reply_to.as_deref()?;
                self.messages
                    .iter()
                    .position(|message| message.is_reply_to(reply_to))
            }) {
                Some(found) => found + 1,
                None => return self.messages.len(),
            },
        };
        while index < self.messages.len() && !self.messages[index].is_durable() {
            index += 1;
        }
        index
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }

    /// First entry sharing the id, or answering the same user message.
    fn conflicting_index(&self, message: &ChatMessage) -> Option<usize> {
        self.messages.iter().position(|existing| conflicts(existing, message))
    }

    /// Remove entries other than `keep` that conflict with the entry at `keep`.
    fn drop_other_conflicts(&mut self, keep: usize) {
        let kept = self.messages[keep].clone();
        let mut index = 0;
        self.messages.retain(|existing| {
            let retain = index == keep || !conflicts(existing, &kept);
            index += 1;
            retain
        });
    }

    fn mutate_temporary<F>(&mut self, id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut ChatMessage),
    {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.id == id && message.is_temporary)
        else {
            return false;
        };
        apply(message);
        let message = message.clone();
        self.pending.push(ChatEvent::MessageUpdated { message });
        true
    }
}

fn anchor_for(message: &ChatMessage, previous: Option<&ChatMessage>) -> Anchor {
    if message.role == Role::Assistant
        && let Some(reply_to) = &message.metadata.reply_to_message_id
    {
        return Anchor {
            after: Some(reply_to.clone()),
            after_reply_to: None,
        };
    }
    Anchor {
        after: previous.map(|entry| entry.id.clone()),
        after_reply_to: previous
            .filter(|entry| entry.role == Role::Assistant)
            .and_then(|entry| entry.metadata.reply_to_message_id.clone()),
    }
}

fn conflicts(existing: &ChatMessage, incoming: &ChatMessage) -> bool {
    if existing.id == incoming.id {
        return true;
    }
    match (
        incoming.role,
        incoming.metadata.reply_to_message_id.as_deref(),
    ) {
        (Role::Assistant, Some(reply_to)) => existing.is_reply_to(reply_to),
        _ => false,
    }
}
