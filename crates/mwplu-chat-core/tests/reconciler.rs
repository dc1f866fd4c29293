//! Turn reconciliation integration tests.

use bytes::Bytes;
use mwplu_chat_core::{
    ChatError, ChatEvent, ChatSession, ConfirmedVia, EventBus, RetryPolicy, TransportError,
    TurnOutcome, TurnReconciler, ValidationError,
};
use mwplu_chat_protocol::{ChatMessage, FinalizeTurnRequest, Role};
use mwplu_chat_test_utils::{ScriptedPersistence, ScriptedResponse, ScriptedWebhook, ndjson_lines};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

struct Harness {
    persistence: Arc<ScriptedPersistence>,
    webhook: Arc<ScriptedWebhook>,
    reconciler: TurnReconciler,
    events: Receiver<ChatEvent>,
}

impl Harness {
    fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self::with_webhook(ScriptedWebhook::new(responses))
    }

    fn with_webhook(webhook: ScriptedWebhook) -> Self {
        let persistence = Arc::new(ScriptedPersistence::new());
        let webhook = Arc::new(webhook);
        let bus = EventBus::new(512);
        let events = bus.subscribe();
        let session = Arc::new(ChatSession::with_event_sink(
            persistence.clone(),
            Arc::new(bus),
        ));
        session.set_user(Some("user-1".to_string()));
        let reconciler = TurnReconciler::new(session, webhook.clone()).with_policy(
            RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(5)),
        );
        Self {
            persistence,
            webhook,
            reconciler,
            events,
        }
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.reconciler.session().messages()
    }

    fn assistant_messages(&self) -> Vec<ChatMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.role == Role::Assistant)
            .collect()
    }

    fn drain_events(&mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn shows_temporary_message(event: &ChatEvent) -> bool {
    match event {
        ChatEvent::MessageAppended { message } | ChatEvent::MessageUpdated { message } => {
            message.is_temporary
        }
        _ => false,
    }
}

#[tokio::test]
async fn json_response_yields_one_assistant_message_and_one_post() {
    let mut harness = Harness::new(vec![ScriptedResponse::json(r#"{"response":"Hello AI"}"#)]);

    let report = harness
        .reconciler
        .send_message("  Bonjour  ", Some("doc-1"))
        .await
        .expect("turn");

    assert_eq!(harness.webhook.calls(), 1);
    assert_eq!(report.response_text, "Hello AI");
    let TurnOutcome::Confirmed {
        assistant_message_id,
        via,
    } = report.outcome
    else {
        panic!("expected confirmed outcome");
    };
    assert_eq!(via, ConfirmedVia::FinalizeRpc);

    let messages = harness.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message, "Bonjour");
    assert_eq!(messages[0].id, report.user_message_id);
    assert_eq!(messages[1].id, assistant_message_id);
    assert_eq!(messages[1].message, "Hello AI");
    assert!(messages[1].is_durable());
    assert!(messages[1].is_reply_to(&report.user_message_id));
    assert_eq!(harness.persistence.finalize_calls(), 1);

    let events = harness.drain_events();
    assert!(events.contains(&ChatEvent::TurnCompleted {
        user_message_id: Some(report.user_message_id.clone()),
        success: true,
    }));
}

#[tokio::test]
async fn webhook_request_carries_user_message_id_and_conversation() {
    let harness = Harness::new(vec![ScriptedResponse::json(r#"{"message":"ok"}"#)]);
    let report = harness
        .reconciler
        .send_message("Quelle zone ?", Some("doc-1"))
        .await
        .expect("turn");

    let requests = harness.webhook.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.message_id, report.user_message_id);
    assert_eq!(request.message, "Quelle zone ?");
    assert_eq!(request.document_id, "doc-1");
    assert_eq!(request.user_id, "user-1");
    assert_eq!(
        request.conversation_id,
        harness.reconciler.session().conversation_id()
    );
    assert!(request.conversation_id.is_some());
}

#[tokio::test]
async fn server_reply_found_by_polling_is_shown_without_temporary_entry() {
    let mut harness = Harness::new(vec![ScriptedResponse::json(r#"{"response":"Hello AI"}"#)]);
    harness.persistence.server_reply_on_load("Réponse du serveur", 2);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    assert!(matches!(
        report.outcome,
        TurnOutcome::Confirmed {
            via: ConfirmedVia::ServerPoll,
            ..
        }
    ));
    assert_eq!(harness.persistence.finalize_calls(), 0);
    assert_eq!(harness.persistence.load_calls(), 2);

    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].message, "Réponse du serveur");
    assert!(assistants[0].is_newly_received);
    assert!(assistants[0].is_reply_to(&report.user_message_id));
    assert!(!harness.drain_events().iter().any(shows_temporary_message));
}

#[tokio::test]
async fn streamed_deltas_end_as_single_hello_world_reply() {
    let body = ndjson_lines(&["Hello", " ", "World"]);
    let (head, tail) = body.split_at(body.len() / 2);
    let (tail, last) = tail.split_at(tail.len() - 3);
    let mut harness = Harness::new(vec![ScriptedResponse::chunks([head, tail, last])]);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    assert_eq!(report.response_text, "Hello World");
    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].message, "Hello World");
    assert!(assistants[0].is_durable());
    assert!(!assistants[0].is_temporary);
    assert!(!harness.reconciler.session().status().is_streaming);

    let events = harness.drain_events();
    assert!(events.contains(&ChatEvent::StreamingChanged { streaming: true }));
    assert!(events.contains(&ChatEvent::StreamingChanged { streaming: false }));
}

#[tokio::test]
async fn streamed_reply_is_replaced_by_the_server_copy_in_place() {
    let mut harness = Harness::new(vec![ScriptedResponse::chunks([ndjson_lines(&[
        "Hello World",
    ])])]);
    harness.persistence.server_reply_on_load("Hello World", 1);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    assert!(matches!(
        report.outcome,
        TurnOutcome::Confirmed {
            via: ConfirmedVia::ServerPoll,
            ..
        }
    ));
    let messages = harness.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].message, "Hello World");
    assert!(messages[1].is_durable());
    assert!(!messages[1].is_newly_received);
    assert!(harness.drain_events().iter().any(shows_temporary_message));
}

#[tokio::test]
async fn ndjson_body_labelled_as_json_is_assembled() {
    let harness = Harness::new(vec![ScriptedResponse::Buffered(ndjson_lines(&[
        "Hello ", "from ", "NDJSON",
    ]))]);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    assert_eq!(report.response_text, "Hello from NDJSON");
    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].message, "Hello from NDJSON");
}

#[tokio::test]
async fn server_error_is_rendered_once_without_retry() {
    let harness = Harness::new(vec![
        ScriptedResponse::status(500, "Server error"),
        ScriptedResponse::json(r#"{"response":"should not be used"}"#),
    ]);

    let err = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ChatError::Transport(TransportError::Status { status: 500, .. })
    ));
    assert!(err.to_string().contains("Server error"));
    assert_eq!(harness.webhook.calls(), 1);

    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert!(assistants[0].metadata.is_error);
    assert!(assistants[0].is_durable());
    assert_eq!(
        assistants[0].message,
        "Désolé, une erreur s'est produite : Server error"
    );
    let status = harness.reconciler.session().status();
    assert_eq!(status.last_error.as_deref(), Some("Server error"));
    assert!(!status.is_loading);
}

#[tokio::test]
async fn empty_reply_adds_no_assistant_message() {
    let harness = Harness::new(vec![ScriptedResponse::json(r#"{"status":"ok"}"#)]);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    assert_eq!(report.outcome, TurnOutcome::Empty);
    assert_eq!(report.response_text, "");
    assert!(harness.assistant_messages().is_empty());
    assert_eq!(harness.persistence.load_calls(), 0);
    assert_eq!(harness.persistence.finalize_calls(), 0);
}

#[tokio::test]
async fn empty_stream_adds_no_assistant_message() {
    let harness = Harness::new(vec![ScriptedResponse::chunks([
        "{\"type\":\"begin\"}\n",
        "{\"type\":\"end\"}\n",
    ])]);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    assert_eq!(report.outcome, TurnOutcome::Empty);
    assert_eq!(harness.messages().len(), 1);
}

#[tokio::test]
async fn user_message_persistence_failure_skips_the_webhook() {
    let harness = Harness::new(vec![ScriptedResponse::json(r#"{"response":"unused"}"#)]);
    harness.persistence.fail_saves_for(Role::User);

    let err = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Persistence(_)));
    assert_eq!(harness.webhook.calls(), 0);
    let messages = harness.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].metadata.is_error);
}

#[tokio::test]
async fn error_reply_falls_back_to_local_entry_when_it_cannot_be_saved() {
    let harness = Harness::new(vec![ScriptedResponse::status(502, "Bad gateway")]);
    harness.persistence.fail_saves_for(Role::Assistant);

    harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .unwrap_err();

    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert!(assistants[0].metadata.is_error);
    assert!(assistants[0].id.starts_with("local-"));
    assert!(!assistants[0].is_temporary);
}

#[tokio::test]
async fn finalize_failure_keeps_the_local_reply() {
    let harness = Harness::new(vec![ScriptedResponse::json(r#"{"response":"Hello AI"}"#)]);
    harness.persistence.fail_finalize(true);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    let TurnOutcome::Unconfirmed { message_id } = report.outcome else {
        panic!("expected unconfirmed outcome");
    };
    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].id, message_id);
    assert_eq!(assistants[0].message, "Hello AI");
    assert!(!assistants[0].is_temporary);
    assert!(!assistants[0].is_durable());
    assert!(assistants[0].metadata.extra.contains_key("webhook_response"));
}

#[tokio::test]
async fn kept_reply_stays_in_place_across_the_next_turn() {
    let harness = Harness::new(vec![
        ScriptedResponse::json(r#"{"response":"first"}"#),
        ScriptedResponse::json(r#"{"response":"second"}"#),
    ]);
    harness.persistence.fail_finalize(true);
    let first = harness
        .reconciler
        .send_message("q1", Some("doc-1"))
        .await
        .expect("turn 1");
    assert!(matches!(first.outcome, TurnOutcome::Unconfirmed { .. }));

    harness.persistence.fail_finalize(false);
    let second = harness
        .reconciler
        .send_message("q2", Some("doc-1"))
        .await
        .expect("turn 2");
    assert!(matches!(second.outcome, TurnOutcome::Confirmed { .. }));

    let order: Vec<(Role, String)> = harness
        .messages()
        .into_iter()
        .map(|message| (message.role, message.message))
        .collect();
    assert_eq!(
        order,
        vec![
            (Role::User, "q1".to_string()),
            (Role::Assistant, "first".to_string()),
            (Role::User, "q2".to_string()),
            (Role::Assistant, "second".to_string()),
        ]
    );
}

#[tokio::test]
async fn finalize_reply_is_rebuilt_when_reload_fails() {
    let harness = Harness::new(vec![ScriptedResponse::json(r#"{"response":"Hello AI"}"#)]);
    harness.persistence.fail_loads(true);

    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");

    let TurnOutcome::Confirmed {
        assistant_message_id,
        via: ConfirmedVia::FinalizeRpc,
    } = report.outcome
    else {
        panic!("expected finalize confirmation");
    };
    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].id, assistant_message_id);
    assert!(assistants[0].is_durable());
    // One load per poll attempt plus the reload after finalize.
    assert_eq!(
        harness.persistence.load_calls() as u32,
        harness.reconciler.policy().max_attempts() + 1
    );
}

#[tokio::test]
async fn repeated_finalize_keeps_a_single_durable_reply() {
    let harness = Harness::new(vec![ScriptedResponse::json(r#"{"response":"Hello AI"}"#)]);
    let report = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .expect("turn");
    let session = harness.reconciler.session();
    let conversation_id = session.conversation_id().expect("conversation");

    let request = FinalizeTurnRequest {
        conversation_id: conversation_id.clone(),
        user_id: "user-1".to_string(),
        document_id: "doc-1".to_string(),
        user_message_id: report.user_message_id.clone(),
        ai_text: "Hello AI".to_string(),
    };
    let first = session.finalize_turn(&request).await.expect("finalize");
    let second = session.finalize_turn(&request).await.expect("finalize");
    assert_eq!(first, second);

    let replies: Vec<_> = harness
        .persistence
        .stored_messages(&conversation_id)
        .await
        .into_iter()
        .filter(|message| message.is_reply_to(&report.user_message_id))
        .collect();
    assert_eq!(replies.len(), 1);
}

#[tokio::test]
async fn validation_errors_are_returned_without_side_effects() {
    let harness = Harness::new(Vec::new());

    let err = harness
        .reconciler
        .send_message("   ", Some("doc-1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::EmptyMessage(_))
    ));
    assert_eq!(
        harness.reconciler.session().status().last_error.as_deref(),
        Some("Le message ne peut pas être vide")
    );

    let err = harness
        .reconciler
        .send_message("Bonjour", None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "ID du document manquant");

    harness.reconciler.session().set_user(None);
    let err = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Utilisateur non authentifié");

    assert_eq!(harness.webhook.calls(), 0);
    assert_eq!(harness.persistence.save_calls(), 0);
    assert!(harness.messages().is_empty());
}

#[tokio::test]
async fn broken_stream_discards_the_partial_reply() {
    let harness = Harness::new(vec![ScriptedResponse::Stream(vec![
        Ok(Bytes::from("{\"type\":\"item\",\"content\":\"Hel\"}\n")),
        Err(TransportError::Body("connection reset".to_string())),
    ])]);

    let err = harness
        .reconciler
        .send_message("Bonjour", Some("doc-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Transport(TransportError::Body(_))));
    assert!(harness.messages().iter().all(|message| !message.is_temporary));
    let assistants = harness.assistant_messages();
    assert_eq!(assistants.len(), 1);
    assert!(assistants[0].metadata.is_error);
    assert!(assistants[0].message.ends_with("connection reset"));
}

#[tokio::test]
async fn overlapping_sends_run_one_after_the_other() {
    let harness = Harness::with_webhook(
        ScriptedWebhook::new(vec![
            ScriptedResponse::json(r#"{"response":"first reply"}"#),
            ScriptedResponse::json(r#"{"response":"second reply"}"#),
        ])
        .with_delay(Duration::from_millis(20)),
    );

    let (first, second) = tokio::join!(
        harness.reconciler.send_message("first", Some("doc-1")),
        harness.reconciler.send_message("second", Some("doc-1")),
    );
    let first = first.expect("first turn");
    let second = second.expect("second turn");

    let texts: Vec<(Role, String)> = harness
        .messages()
        .into_iter()
        .map(|message| (message.role, message.message))
        .collect();
    assert_eq!(
        texts,
        vec![
            (Role::User, "first".to_string()),
            (Role::Assistant, "first reply".to_string()),
            (Role::User, "second".to_string()),
            (Role::Assistant, "second reply".to_string()),
        ]
    );
    let messages = harness.messages();
    assert!(messages[1].is_reply_to(&first.user_message_id));
    assert!(messages[3].is_reply_to(&second.user_message_id));
    assert_eq!(harness.webhook.calls(), 2);
}
