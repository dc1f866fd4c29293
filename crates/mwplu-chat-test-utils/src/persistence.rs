use async_trait::async_trait;
use chrono::Utc;
use mwplu_chat_core::{ChatPersistence, InMemoryPersistence, NewMessage, PersistenceError};
use mwplu_chat_protocol::{
    ChatMessage, Conversation, ConversationId, FinalizeTurnRequest, FinalizeTurnResult,
    MessageMetadata, Role,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Durable assistant reply keyed to a user message.
pub fn assistant_reply(id: &str, text: &str, reply_to: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        role: Role::Assistant,
        message: text.to_string(),
        metadata: MessageMetadata::reply_to(reply_to),
        is_temporary: false,
        is_newly_received: false,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Clone)]
struct PendingReply {
    text: String,
    /// Loads to wait before the reply becomes visible.
    remaining_loads: usize,
}

/// In-memory persistence with scripted server behaviour and call counters.
///
/// A scheduled server reply models the webhook backend writing its own
/// assistant row: it is attached to the latest unanswered user message once
/// enough `get_messages` calls have happened.
#[derive(Default)]
pub struct ScriptedPersistence {
    inner: InMemoryPersistence,
    pending_reply: Mutex<Option<PendingReply>>,
    fail_saves: Mutex<Vec<Role>>,
    fail_finalize: Mutex<bool>,
    fail_loads: Mutex<bool>,
    saves: AtomicUsize,
    loads: AtomicUsize,
    finalizes: AtomicUsize,
}

impl ScriptedPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a server reply visible starting at the `nth` load (1-based).
    pub fn server_reply_on_load(&self, text: impl Into<String>, nth: usize) {
        *self.pending_reply.lock() = Some(PendingReply {
            text: text.into(),
            remaining_loads: nth.saturating_sub(1),
        });
    }

    /// Fail every save of messages with `role`.
    pub fn fail_saves_for(&self, role: Role) {
        self.fail_saves.lock().push(role);
    }

    pub fn fail_finalize(&self, fail: bool) {
        *self.fail_finalize.lock() = fail;
    }

    pub fn fail_loads(&self, fail: bool) {
        *self.fail_loads.lock() = fail;
    }

    pub fn save_calls(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalizes.load(Ordering::SeqCst)
    }

    /// Durable rows of a conversation, bypassing scripting.
    pub async fn stored_messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.inner
            .get_messages(conversation_id)
            .await
            .unwrap_or_default()
    }

    fn take_due_reply(&self) -> Option<String> {
        let mut pending = self.pending_reply.lock();
        let reply = pending.as_mut()?;
        if reply.remaining_loads > 0 {
            reply.remaining_loads -= 1;
            return None;
        }
        pending.take().map(|reply| reply.text)
    }

    async fn write_server_reply(
        &self,
        conversation_id: &str,
        text: String,
    ) -> Result<(), PersistenceError> {
        let messages = self.inner.get_messages(conversation_id).await?;
        let unanswered = messages.iter().rev().find(|message| {
            message.role == Role::User && !messages.iter().any(|other| other.is_reply_to(&message.id))
        });
        let Some(user) = unanswered else {
            return Ok(());
        };
        self.inner
            .save_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                user_id: String::new(),
                document_id: String::new(),
                role: Role::Assistant,
                message: text,
                metadata: MessageMetadata::reply_to(user.id.clone()),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatPersistence for ScriptedPersistence {
    async fn active_conversation_id(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<ConversationId>, PersistenceError> {
        self.inner.active_conversation_id(user_id, document_id).await
    }

    async fn get_or_create_conversation(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Conversation, PersistenceError> {
        self.inner
            .get_or_create_conversation(user_id, document_id)
            .await
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, PersistenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if *self.fail_loads.lock() {
            return Err(PersistenceError::Backend("load failed".to_string()));
        }
        if let Some(text) = self.take_due_reply() {
            self.write_server_reply(conversation_id, text).await?;
        }
        self.inner.get_messages(conversation_id).await
    }

    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, PersistenceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.lock().contains(&message.role) {
            return Err(PersistenceError::Backend(format!(
                "save failed for {}",
                message.role
            )));
        }
        self.inner.save_message(message).await
    }

    async fn finalize_turn(
        &self,
        request: &FinalizeTurnRequest,
    ) -> Result<FinalizeTurnResult, PersistenceError> {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        if *self.fail_finalize.lock() {
            return Err(PersistenceError::Backend("finalize failed".to_string()));
        }
        self.inner.finalize_turn(request).await
    }

    async fn deactivate_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<(), PersistenceError> {
        self.inner.deactivate_conversation(conversation_id).await
    }
}
