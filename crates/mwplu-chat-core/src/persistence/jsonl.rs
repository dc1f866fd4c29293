//! Conversation persistence using one JSONL event log per conversation.

use super::ledger::{ConversationLog, LedgerEvent, Replay, SCHEMA_VERSION, new_conversation};
use super::{ChatPersistence, NewMessage};
use crate::error::PersistenceError;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use mwplu_chat_protocol::{
    ChatMessage, Conversation, ConversationId, FinalizeTurnRequest, FinalizeTurnResult,
};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// JSONL-backed persistence rooted at a directory.
pub struct JsonlPersistence {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the logs.
    write_lock: Mutex<()>,
}

impl JsonlPersistence {
    /// Open (or create) a store under `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        info!("initialized JSONL chat store (root={})", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, conversation_id: &str) -> PathBuf {
        self.root.join(format!("{conversation_id}.jsonl"))
    }

    fn append_event(&self, conversation_id: &str, event: &LedgerEvent) -> Result<(), PersistenceError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.log_path(conversation_id))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn write_new_log(&self, conversation: &Conversation) -> Result<(), PersistenceError> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.log_path(&conversation.id))?;
        let header = serde_json::to_string(&LedgerEvent::SchemaVersion {
            version: SCHEMA_VERSION,
        })?;
        writeln!(file, "{header}")?;
        let created = serde_json::to_string(&LedgerEvent::ConversationCreated {
            conversation: conversation.clone(),
        })?;
        writeln!(file, "{created}")?;
        Ok(())
    }

    fn read_log(&self, conversation_id: &str) -> Result<ConversationLog, PersistenceError> {
        let path = self.log_path(conversation_id);
        if !path.exists() {
            return Err(PersistenceError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        read_log_file(&path)
    }

    /// Every readable conversation log in the store directory.
    fn scan_logs(&self) -> Result<Vec<ConversationLog>, PersistenceError> {
        let mut logs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            match read_log_file(&path) {
                Ok(log) => logs.push(log),
                Err(err) => warn!(
                    "skipping unreadable conversation log (path={}, error={})",
                    path.display(),
                    err
                ),
            }
        }
        logs.sort_by(|a, b| a.conversation.created_at.cmp(&b.conversation.created_at));
        Ok(logs)
    }

    fn find_active(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<Conversation>, PersistenceError> {
        Ok(self
            .scan_logs()?
            .into_iter()
            .rev()
            .find(|log| log.is_active_for(user_id, document_id))
            .map(|log| log.conversation))
    }
}

fn read_log_file(path: &Path) -> Result<ConversationLog, PersistenceError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let reader = BufReader::new(file);
    let mut replay = Replay::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: LedgerEvent = serde_json::from_str(&line)?;
        replay.apply(event)?;
    }
    replay.finish(&path.display().to_string())
}

#[async_trait]
impl ChatPersistence for JsonlPersistence {
    async fn active_conversation_id(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<ConversationId>, PersistenceError> {
        Ok(self
            .find_active(user_id, document_id)?
            .map(|conversation| conversation.id))
    }

    async fn get_or_create_conversation(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Conversation, PersistenceError> {
        let _guard = self.write_lock.lock();
        if let Some(conversation) = self.find_active(user_id, document_id)? {
            return Ok(conversation);
        }
        let conversation = new_conversation(user_id, document_id)?;
        info!(
            "recording conversation creation (conversation_id={}, document_id={})",
            conversation.id, document_id
        );
        self.write_new_log(&conversation)?;
        Ok(conversation)
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, PersistenceError> {
        Ok(self.read_log(conversation_id)?.messages)
    }

    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, PersistenceError> {
        let _guard = self.write_lock.lock();
        let conversation_id = message.conversation_id.clone();
        let log = self.read_log(&conversation_id)?;
        let saved = log.prepare_message(message)?;
        debug!(
            "appending message event (conversation_id={}, role={}, content_len={})",
            conversation_id,
            saved.role,
            saved.message.len()
        );
        self.append_event(
            &conversation_id,
            &LedgerEvent::MessageSaved {
                conversation_id: conversation_id.clone(),
                message: saved.clone(),
            },
        )?;
        Ok(saved)
    }

    async fn finalize_turn(
        &self,
        request: &FinalizeTurnRequest,
    ) -> Result<FinalizeTurnResult, PersistenceError> {
        let _guard = self.write_lock.lock();
        let log = self.read_log(&request.conversation_id)?;
        let plan = log.prepare_finalize(request)?;
        match plan.reply {
            Some(reply) => {
                info!(
                    "finalizing turn (conversation_id={}, user_message_id={}, assistant_message_id={})",
                    request.conversation_id, request.user_message_id, reply.id
                );
                self.append_event(
                    &request.conversation_id,
                    &LedgerEvent::MessageSaved {
                        conversation_id: request.conversation_id.clone(),
                        message: reply,
                    },
                )?;
            }
            None => debug!(
                "turn already finalized (conversation_id={}, user_message_id={})",
                request.conversation_id, request.user_message_id
            ),
        }
        Ok(plan.result)
    }

    async fn deactivate_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        let log = self.read_log(conversation_id)?;
        if !log.conversation.is_active {
            return Ok(());
        }
        info!("deactivating conversation (conversation_id={})", conversation_id);
        self.append_event(
            conversation_id,
            &LedgerEvent::ConversationDeactivated {
                conversation_id: conversation_id.to_string(),
                deactivated_at: Utc::now(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwplu_chat_protocol::{MessageMetadata, Role};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn user_message(conversation_id: &str, text: &str) -> NewMessage {
        NewMessage {
            conversation_id: conversation_id.to_string(),
            user_id: "user-1".into(),
            document_id: "doc-1".into(),
            role: Role::User,
            message: text.to_string(),
            metadata: MessageMetadata::default(),
        }
    }

    #[tokio::test]
    async fn conversation_survives_reopen() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlPersistence::new(temp.path()).expect("store");
        let conversation = store
            .get_or_create_conversation("user-1", "doc-1")
            .await
            .expect("conversation");
        let saved = store
            .save_message(user_message(&conversation.id, "Quelle est la hauteur max ?"))
            .await
            .expect("save");

        let reopened = JsonlPersistence::new(temp.path()).expect("reopen");
        assert_eq!(
            reopened
                .active_conversation_id("user-1", "doc-1")
                .await
                .expect("active"),
            Some(conversation.id.clone())
        );
        let messages = reopened.get_messages(&conversation.id).await.expect("messages");
        assert_eq!(messages, vec![saved]);
    }

    #[tokio::test]
    async fn finalize_is_idempotent_on_disk() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlPersistence::new(temp.path()).expect("store");
        let conversation = store
            .get_or_create_conversation("user-1", "doc-1")
            .await
            .expect("conversation");
        let user = store
            .save_message(user_message(&conversation.id, "Bonjour"))
            .await
            .expect("save");
        let request = FinalizeTurnRequest {
            conversation_id: conversation.id.clone(),
            user_id: "user-1".into(),
            document_id: "doc-1".into(),
            user_message_id: user.id.clone(),
            ai_text: "Bonjour !".into(),
        };
        let first = store.finalize_turn(&request).await.expect("first");
        let second = store.finalize_turn(&request).await.expect("second");
        assert_eq!(first, second);

        let replies: Vec<_> = store
            .get_messages(&conversation.id)
            .await
            .expect("messages")
            .into_iter()
            .filter(|message| message.is_reply_to(&user.id))
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, first.assistant_message_id);
    }

    #[tokio::test]
    async fn deactivated_conversation_is_replaced_by_a_new_one() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlPersistence::new(temp.path()).expect("store");
        let first = store
            .get_or_create_conversation("user-1", "doc-1")
            .await
            .expect("conversation");
        store
            .deactivate_conversation(&first.id)
            .await
            .expect("deactivate");
        store
            .deactivate_conversation(&first.id)
            .await
            .expect("deactivate twice");
        assert_eq!(
            store
                .active_conversation_id("user-1", "doc-1")
                .await
                .expect("active"),
            None
        );
        let second = store
            .get_or_create_conversation("user-1", "doc-1")
            .await
            .expect("conversation");
        assert!(second.id != first.id);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlPersistence::new(temp.path()).expect("store");
        let err = store.get_messages("missing").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
