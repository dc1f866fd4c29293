//! Chat session: the per-user, per-document conversation view.

use crate::error::{ChatError, ValidationError};
use crate::persistence::{ChatPersistence, NewMessage};
use crate::store::MessageStore;
use log::{debug, info};
use mwplu_chat_config::MessagesConfig;
use mwplu_chat_protocol::{
    ChatEvent, ChatMessage, ConversationId, EventSink, FinalizeTurnRequest, FinalizeTurnResult,
    MessageMetadata, NoopSink, Role,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;

/// Snapshot of the session flags a UI renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatStatus {
    pub is_loading: bool,
    pub is_streaming: bool,
    pub last_error: Option<String>,
    pub has_messages: bool,
    pub has_conversation: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    user_id: Option<String>,
    document_id: Option<String>,
    conversation_id: Option<ConversationId>,
    store: MessageStore,
    is_loading: bool,
    is_streaming: bool,
    last_error: Option<String>,
}

/// Owns the message list of the active conversation and keeps it in step
/// with the persistence collaborator.
///
/// Locks are never held across an await; each operation snapshots what it
/// needs, performs I/O, then applies the result. Store events reach the sink
/// only after the state lock is released, so a sink may read the session.
pub struct ChatSession {
    persistence: Arc<dyn ChatPersistence>,
    sink: Arc<dyn EventSink>,
    texts: MessagesConfig,
    state: RwLock<SessionState>,
}

impl ChatSession {
    pub fn new(persistence: Arc<dyn ChatPersistence>) -> Self {
        Self::with_event_sink(persistence, Arc::new(NoopSink))
    }

    /// Session that reports store changes to `sink`.
    pub fn with_event_sink(persistence: Arc<dyn ChatPersistence>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            persistence,
            sink,
            texts: MessagesConfig::default(),
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Override the user-facing texts.
    pub fn with_messages(mut self, texts: MessagesConfig) -> Self {
        self.texts = texts;
        self
    }

    pub fn texts(&self) -> &MessagesConfig {
        &self.texts
    }

    /// Set or clear the authenticated user.
    pub fn set_user(&self, user_id: Option<String>) {
        self.state.write().user_id = user_id.filter(|id| !id.trim().is_empty());
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    pub fn document_id(&self) -> Option<String> {
        self.state.read().document_id.clone()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.state.read().conversation_id.clone()
    }

    /// Snapshot of the displayed messages.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().store.messages().to_vec()
    }

    pub fn status(&self) -> ChatStatus {
        let state = self.state.read();
        ChatStatus {
            is_loading: state.is_loading,
            is_streaming: state.is_streaming,
            last_error: state.last_error.clone(),
            has_messages: !state.store.is_empty(),
            has_conversation: state.conversation_id.is_some(),
        }
    }

    /// Bind the session to a document and load its active conversation.
    ///
    /// Returns true when an existing conversation was found. Switching to a
    /// different document resets the local view first.
    pub async fn initialize(&self, document_id: &str) -> Result<bool, ChatError> {
        let user_id = self.require_user()?;
        let document_id = self.require_document(Some(document_id))?;
        self.bind_document(&document_id);

        let active = self
            .persistence
            .active_conversation_id(&user_id, &document_id)
            .await
            .map_err(|err| self.record_error(err.into()))?;
        let Some(conversation_id) = active else {
            debug!("no active conversation (document_id={})", document_id);
            return Ok(false);
        };
        info!(
            "resuming conversation (conversation_id={}, document_id={})",
            conversation_id, document_id
        );
        self.state.write().conversation_id = Some(conversation_id);
        self.load_messages().await?;
        Ok(true)
    }

    /// Refresh the durable view from the server, keeping client-only entries.
    pub async fn load_messages(&self) -> Result<(), ChatError> {
        let Some(conversation_id) = self.conversation_id() else {
            return Ok(());
        };
        self.state.write().is_loading = true;
        let result = self.persistence.get_messages(&conversation_id).await;
        let mut state = self.state.write();
        state.is_loading = false;
        match result {
            Ok(server) => {
                debug!(
                    "loaded messages (conversation_id={}, count={})",
                    conversation_id,
                    server.len()
                );
                state.store.sync_durable(Some(&conversation_id), server);
                self.release(state);
                Ok(())
            }
            Err(err) => {
                let err = ChatError::from(err);
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Reload and return the displayed server reply to `user_message_id`.
    ///
    /// A reply with no displayed entry (temporary or durable) before this
    /// reload is flagged as newly received.
    pub async fn fetch_reply(&self, user_message_id: &str) -> Result<Option<ChatMessage>, ChatError> {
        let Some(conversation_id) = self.conversation_id() else {
            return Ok(None);
        };
        let server = self.persistence.get_messages(&conversation_id).await?;
        let mut state = self.state.write();
        let already_shown = state.store.find_reply(user_message_id).is_some();
        state.store.sync_durable(Some(&conversation_id), server);
        let reply = state
            .store
            .find_reply(user_message_id)
            .filter(|reply| reply.is_durable())
            .map(|reply| reply.id.clone());
        let reply = match reply {
            Some(id) if !already_shown => {
                state.store.mark_newly_received(&id);
                state.store.get(&id).cloned()
            }
            Some(id) => state.store.get(&id).cloned(),
            None => None,
        };
        self.release(state);
        Ok(reply)
    }

    /// Active conversation id, creating the conversation when needed.
    pub async fn ensure_conversation(&self) -> Result<ConversationId, ChatError> {
        if let Some(conversation_id) = self.conversation_id() {
            return Ok(conversation_id);
        }
        let user_id = self.require_user()?;
        let document_id = self.require_document(None)?;
        let conversation = self
            .persistence
            .get_or_create_conversation(&user_id, &document_id)
            .await?;
        info!(
            "using conversation (conversation_id={}, document_id={})",
            conversation.id, document_id
        );
        let mut state = self.state.write();
        // A concurrent caller may have bound one first.
        Ok(state
            .conversation_id
            .get_or_insert(conversation.id)
            .clone())
    }

    /// Persist a message and append its durable form.
    pub async fn add_message(
        &self,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<ChatMessage, ChatError> {
        let saved = self.save_message_only(role, content, metadata).await?;
        self.with_store(|store| store.push(saved.clone()));
        Ok(saved)
    }

    /// Persist a message without displaying it.
    pub async fn save_message_only(
        &self,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<ChatMessage, ChatError> {
        let conversation_id = self.ensure_conversation().await?;
        let user_id = self.require_user()?;
        let document_id = self.require_document(None)?;
        let saved = self
            .persistence
            .save_message(NewMessage {
                conversation_id,
                user_id,
                document_id,
                role,
                message: content.to_string(),
                metadata,
            })
            .await?;
        debug!("saved message (id={}, role={})", saved.id, saved.role);
        Ok(saved)
    }

    /// Ask the persistence collaborator to write the turn's reply exactly once.
    pub async fn finalize_turn(
        &self,
        request: &FinalizeTurnRequest,
    ) -> Result<FinalizeTurnResult, ChatError> {
        Ok(self.persistence.finalize_turn(request).await?)
    }

    pub fn add_temporary_message(
        &self,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) -> ChatMessage {
        self.with_store(|store| store.add_temporary_message_with(role, content, metadata))
    }

    pub fn update_temporary_message_content(&self, id: &str, content: &str) -> bool {
        self.with_store(|store| store.update_temporary_message_content(id, content))
    }

    pub fn append_to_temporary_message(&self, id: &str, delta: &str) -> bool {
        self.with_store(|store| store.append_to_temporary_message(id, delta))
    }

    pub fn replace_temporary_message(&self, temp_id: &str, durable: ChatMessage) -> bool {
        self.with_store(|store| store.replace_temporary_message(temp_id, durable))
    }

    pub fn remove_temporary_message(&self, temp_id: &str) -> bool {
        self.with_store(|store| store.remove_temporary_message(temp_id))
    }

    pub fn confirm_temporary_message(&self, temp_id: &str) -> bool {
        self.with_store(|store| store.confirm_temporary_message(temp_id))
    }

    /// Display a message that has no durable counterpart.
    pub fn push_local(&self, message: ChatMessage) {
        self.with_store(|store| store.push(message));
    }

    /// Deactivate the conversation server-side and empty the view.
    pub async fn clear_chat(&self) -> Result<(), ChatError> {
        if let Some(conversation_id) = self.conversation_id() {
            self.persistence
                .deactivate_conversation(&conversation_id)
                .await
                .map_err(|err| self.record_error(err.into()))?;
            info!("cleared conversation (conversation_id={})", conversation_id);
        }
        let mut state = self.state.write();
        state.store.clear();
        state.conversation_id = None;
        state.last_error = None;
        self.release(state);
        Ok(())
    }

    /// Forget the document, conversation, and messages locally.
    pub fn reset_chat(&self) {
        let mut state = self.state.write();
        state.store.clear();
        state.document_id = None;
        state.conversation_id = None;
        state.is_loading = false;
        state.is_streaming = false;
        state.last_error = None;
        self.release(state);
    }

    pub fn set_loading(&self, loading: bool) {
        self.state.write().is_loading = loading;
    }

    pub fn set_streaming(&self, streaming: bool) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.is_streaming != streaming;
            state.is_streaming = streaming;
            changed
        };
        if changed {
            self.sink.emit(ChatEvent::StreamingChanged { streaming });
        }
    }

    pub fn set_last_error(&self, error: Option<String>) {
        self.state.write().last_error = error;
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        self.sink.emit(event);
    }

    /// Bind the session to `document_id`, resetting when it changes.
    pub(crate) fn bind_document(&self, document_id: &str) {
        if self.document_id().as_deref() == Some(document_id) {
            return;
        }
        if let Some(previous) = self.document_id() {
            debug!(
                "switching document (previous={}, document_id={})",
                previous, document_id
            );
        }
        self.reset_chat();
        self.state.write().document_id = Some(document_id.to_string());
    }

    pub(crate) fn require_user(&self) -> Result<String, ValidationError> {
        self.user_id()
            .ok_or_else(|| ValidationError::Unauthenticated(self.texts.unauthenticated.clone()))
    }

    pub(crate) fn require_document(&self, document_id: Option<&str>) -> Result<String, ValidationError> {
        document_id
            .map(str::to_string)
            .or_else(|| self.document_id())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingDocument(self.texts.missing_document.clone()))
    }

    fn with_store<R>(&self, apply: impl FnOnce(&mut MessageStore) -> R) -> R {
        let mut state = self.state.write();
        let result = apply(&mut state.store);
        self.release(state);
        result
    }

    /// Drop the guard, then deliver what the store queued under it.
    fn release(&self, mut state: RwLockWriteGuard<'_, SessionState>) {
        let events = state.store.take_events();
        drop(state);
        for event in events {
            self.sink.emit(event);
        }
    }

    fn record_error(&self, err: ChatError) -> ChatError {
        self.state.write().last_error = Some(err.to_string());
        err
    }
}
