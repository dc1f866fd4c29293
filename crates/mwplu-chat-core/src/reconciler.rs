//! Turn reconciliation: one user message through to exactly one durable reply.
//!
//! A turn persists the user message, posts it to the webhook once, decodes
//! the reply text, then looks for the reply the webhook backend persisted on
//! its own. Only when polling comes up empty does the client display a
//! temporary entry and ask the persistence layer to finalize the turn, which
//! is idempotent per user message. If that fails too the temporary entry is
//! kept as final.

use crate::decoder::{NdjsonDecoder, decode_buffered_body};
use crate::error::{ChatError, TransportError, ValidationError};
use crate::policy::RetryPolicy;
use crate::session::ChatSession;
use crate::transport::{WebhookResponse, WebhookTransport};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use mwplu_chat_config::ChatConfig;
use mwplu_chat_protocol::{
    ChatEvent, ChatMessage, FinalizeTurnRequest, MessageId, MessageMetadata, Role, WebhookRequest,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a durable reply was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmedVia {
    /// The webhook backend's own write was found by polling.
    ServerPoll,
    /// The finalize-turn call wrote (or returned) the reply.
    FinalizeRpc,
}

/// Terminal state of a successful turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Confirmed {
        assistant_message_id: MessageId,
        via: ConfirmedVia,
    },
    /// The reply is displayed without a durable counterpart.
    Unconfirmed { message_id: MessageId },
    /// The webhook produced no displayable text.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub user_message_id: MessageId,
    pub outcome: TurnOutcome,
    /// Decoded assistant text; empty for [`TurnOutcome::Empty`].
    pub response_text: String,
}

struct DecodedReply {
    text: String,
    /// Entry shown while the stream was arriving.
    temp_id: Option<MessageId>,
    payload: Option<Value>,
}

/// Drives chat turns against a webhook and a [`ChatSession`].
///
/// Turns are serialized: a second `send_message` waits for the first one to
/// reach a terminal state.
pub struct TurnReconciler {
    session: Arc<ChatSession>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    turn_lock: Mutex<()>,
}

impl TurnReconciler {
    pub fn new(session: Arc<ChatSession>, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            session,
            transport,
            policy: RetryPolicy::default(),
            turn_lock: Mutex::new(()),
        }
    }

    /// Reconciler using the configured polling policy.
    pub fn from_config(
        config: &ChatConfig,
        session: Arc<ChatSession>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        Self::new(session, transport).with_policy(RetryPolicy::from_config(&config.reconcile))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn session(&self) -> &Arc<ChatSession> {
        &self.session
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one turn for `message`.
    ///
    /// `document_id` defaults to the session's bound document. Validation
    /// failures are returned without touching the network or the message
    /// list. Any later failure is also rendered as an error reply.
    pub async fn send_message(
        &self,
        message: &str,
        document_id: Option<&str>,
    ) -> Result<TurnReport, ChatError> {
        let (content, document_id, user_id) = self.validate(message, document_id).map_err(|err| {
            self.session.set_last_error(Some(err.to_string()));
            ChatError::from(err)
        })?;

        let _turn = self.turn_lock.lock().await;
        self.session.bind_document(&document_id);
        self.session.set_loading(true);
        self.session.set_last_error(None);

        let mut user_message_id = None;
        let result = self
            .run_turn(&content, &document_id, &user_id, &mut user_message_id)
            .await;

        self.session.set_streaming(false);
        self.session.set_loading(false);
        if let Err(err) = &result {
            self.session.set_last_error(Some(err.to_string()));
        }
        self.session.emit(ChatEvent::TurnCompleted {
            user_message_id,
            success: result.is_ok(),
        });
        result
    }

    fn validate(
        &self,
        message: &str,
        document_id: Option<&str>,
    ) -> Result<(String, String, String), ValidationError> {
        let content = message.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyMessage(
                self.session.texts().empty_message.clone(),
            ));
        }
        let document_id = self.session.require_document(document_id)?;
        let user_id = self.session.require_user()?;
        Ok((content.to_string(), document_id, user_id))
    }

    async fn run_turn(
        &self,
        content: &str,
        document_id: &str,
        user_id: &str,
        user_message_id: &mut Option<MessageId>,
    ) -> Result<TurnReport, ChatError> {
        let user = match self
            .session
            .add_message(Role::User, content, MessageMetadata::default())
            .await
        {
            Ok(user) => user,
            Err(err) => return Err(self.fail(err).await),
        };
        *user_message_id = Some(user.id.clone());

        let request = WebhookRequest {
            message_id: user.id.clone(),
            message: content.to_string(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            conversation_id: self.session.conversation_id(),
        };
        let response = match self.transport.send(&request).await {
            Ok(response) => response,
            Err(err) => return Err(self.fail(err.into()).await),
        };

        let reply = match response {
            WebhookResponse::Stream(stream) => match self.consume_stream(stream, &user.id).await {
                Ok(reply) => reply,
                Err(err) => return Err(self.fail(err).await),
            },
            WebhookResponse::Buffered(body) => {
                let decoded = decode_buffered_body(&body);
                debug!(
                    "decoded buffered body (message_id={}, format={:?}, text_len={})",
                    user.id,
                    decoded.format,
                    decoded.text.len()
                );
                DecodedReply {
                    text: decoded.text,
                    temp_id: None,
                    payload: decoded.payload,
                }
            }
        };

        if reply.text.is_empty() {
            if let Some(temp_id) = &reply.temp_id {
                self.session.remove_temporary_message(temp_id);
            }
            info!("webhook returned no displayable text (message_id={})", user.id);
            return Ok(TurnReport {
                user_message_id: user.id,
                outcome: TurnOutcome::Empty,
                response_text: String::new(),
            });
        }

        let outcome = self.reconcile(&user, document_id, user_id, &reply).await;
        info!(
            "turn completed (message_id={}, outcome={:?})",
            user.id, outcome
        );
        Ok(TurnReport {
            user_message_id: user.id,
            outcome,
            response_text: reply.text,
        })
    }

    /// Read a streamed body, showing deltas in one temporary reply.
    async fn consume_stream(
        &self,
        mut stream: BoxStream<'static, Result<Bytes, TransportError>>,
        user_message_id: &str,
    ) -> Result<DecodedReply, ChatError> {
        self.session.set_streaming(true);
        let mut decoder = NdjsonDecoder::new();
        let mut temp_id = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for delta in decoder.push(&bytes) {
                        self.show_delta(&mut temp_id, &delta, user_message_id);
                    }
                }
                Err(err) => {
                    warn!(
                        "stream failed mid-body (message_id={}, error={})",
                        user_message_id, err
                    );
                    if let Some(temp_id) = &temp_id {
                        self.session.remove_temporary_message(temp_id);
                    }
                    self.session.set_streaming(false);
                    return Err(err.into());
                }
            }
        }
        if let Some(delta) = decoder.finish() {
            self.show_delta(&mut temp_id, &delta, user_message_id);
        }
        self.session.set_streaming(false);
        if decoder.skipped_lines() > 0 {
            warn!(
                "skipped undecodable stream lines (message_id={}, count={})",
                user_message_id,
                decoder.skipped_lines()
            );
        }
        Ok(DecodedReply {
            text: decoder.into_text(),
            temp_id,
            payload: None,
        })
    }

    fn show_delta(&self, temp_id: &mut Option<MessageId>, delta: &str, user_message_id: &str) {
        match temp_id {
            Some(id) => {
                self.session.append_to_temporary_message(id, delta);
            }
            None => {
                let temp = self.session.add_temporary_message(
                    Role::Assistant,
                    delta,
                    MessageMetadata::reply_to(user_message_id),
                );
                *temp_id = Some(temp.id);
            }
        }
    }

    async fn reconcile(
        &self,
        user: &ChatMessage,
        document_id: &str,
        user_id: &str,
        reply: &DecodedReply,
    ) -> TurnOutcome {
        let session = self.session.as_ref();
        let user_message_id = user.id.as_str();
        let found = self
            .policy
            .poll(move |attempt| async move {
                match session.fetch_reply(user_message_id).await {
                    Ok(found) => Ok::<_, ChatError>(found),
                    Err(err) => {
                        warn!(
                            "reload failed while polling (message_id={}, attempt={}, error={})",
                            user_message_id, attempt, err
                        );
                        Ok(None)
                    }
                }
            })
            .await
            .unwrap_or(None);

        if let Some(durable) = found {
            if let Some(temp_id) = &reply.temp_id {
                self.session.replace_temporary_message(temp_id, durable.clone());
            }
            return TurnOutcome::Confirmed {
                assistant_message_id: durable.id,
                via: ConfirmedVia::ServerPoll,
            };
        }

        let timeout = ChatError::ReconciliationTimeout {
            user_message_id: user.id.clone(),
            attempts: self.policy.max_attempts(),
        };
        info!("{timeout}, finalizing turn");

        let temp_id = match &reply.temp_id {
            Some(temp_id) => temp_id.clone(),
            None => {
                let mut metadata = MessageMetadata::reply_to(user.id.clone());
                if let Some(payload) = &reply.payload {
                    metadata = metadata.with_extra("webhook_response", payload.clone());
                }
                self.session
                    .add_temporary_message(Role::Assistant, &reply.text, metadata)
                    .id
            }
        };

        match self.finalize(user, document_id, user_id, &reply.text).await {
            Ok(assistant_message_id) => {
                self.adopt_finalized(user, &temp_id, &assistant_message_id, &reply.text)
                    .await;
                TurnOutcome::Confirmed {
                    assistant_message_id,
                    via: ConfirmedVia::FinalizeRpc,
                }
            }
            Err(err) => {
                warn!(
                    "finalize failed, keeping local reply (message_id={}, temp_id={}, error={})",
                    user.id, temp_id, err
                );
                self.session.confirm_temporary_message(&temp_id);
                TurnOutcome::Unconfirmed { message_id: temp_id }
            }
        }
    }

    async fn finalize(
        &self,
        user: &ChatMessage,
        document_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<MessageId, ChatError> {
        let conversation_id = self.session.ensure_conversation().await?;
        let result = self
            .session
            .finalize_turn(&FinalizeTurnRequest {
                conversation_id,
                user_id: user_id.to_string(),
                document_id: document_id.to_string(),
                user_message_id: user.id.clone(),
                ai_text: text.to_string(),
            })
            .await?;
        debug!(
            "turn finalized (message_id={}, assistant_message_id={}, conversation_turn={})",
            user.id, result.assistant_message_id, result.conversation_turn
        );
        Ok(result.assistant_message_id)
    }

    /// Swap the temporary reply for the finalized one.
    ///
    /// A reload normally brings the durable row in and supersedes the
    /// temporary entry. When it does not, the entry is rebuilt from the
    /// finalize result.
    async fn adopt_finalized(
        &self,
        user: &ChatMessage,
        temp_id: &str,
        assistant_message_id: &str,
        text: &str,
    ) {
        if let Err(err) = self.session.fetch_reply(&user.id).await {
            warn!(
                "reload after finalize failed (message_id={}, error={})",
                user.id, err
            );
        }
        let still_temporary = self
            .session
            .messages()
            .iter()
            .any(|message| message.id == temp_id);
        if !still_temporary {
            return;
        }
        let durable = ChatMessage {
            id: assistant_message_id.to_string(),
            role: Role::Assistant,
            message: text.to_string(),
            metadata: MessageMetadata::reply_to(user.id.clone()),
            is_temporary: false,
            is_newly_received: false,
            created_at: Utc::now(),
        };
        self.session.replace_temporary_message(temp_id, durable);
    }

    /// Render `err` as an error reply, then hand it back.
    async fn fail(&self, err: ChatError) -> ChatError {
        let text = self.session.texts().error_reply(&err.to_string());
        match self
            .session
            .add_message(Role::Assistant, &text, MessageMetadata::error())
            .await
        {
            Ok(saved) => debug!("persisted error reply (id={})", saved.id),
            Err(save_err) => {
                warn!(
                    "could not persist error reply, showing it locally (error={})",
                    save_err
                );
                self.session
                    .push_local(ChatMessage::local(Role::Assistant, text, MessageMetadata::error()));
            }
        }
        err
    }
}
