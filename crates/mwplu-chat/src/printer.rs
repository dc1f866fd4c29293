//! Renders assistant replies from store events as terminal text.

use mwplu_chat::protocol::{ChatEvent, ChatMessage, Role};
use std::collections::HashMap;

/// Turns store events into incremental stdout output.
///
/// Each reply is keyed by the user message it answers, so a temporary entry
/// and the durable copy that replaces it print once.
#[derive(Debug, Default)]
pub struct ReplyPrinter {
    printed: HashMap<String, String>,
    wrote_this_turn: bool,
}

impl ReplyPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to write for `event`, if any.
    pub fn render(&mut self, event: &ChatEvent) -> Option<String> {
        match event {
            ChatEvent::MessageAppended { message }
            | ChatEvent::MessageUpdated { message }
            | ChatEvent::MessageReplaced { message, .. } => self.render_message(message),
            ChatEvent::TurnCompleted { .. } => {
                std::mem::take(&mut self.wrote_this_turn).then(|| "\n".to_string())
            }
            _ => None,
        }
    }

    fn render_message(&mut self, message: &ChatMessage) -> Option<String> {
        if message.role != Role::Assistant {
            return None;
        }
        let key = message
            .metadata
            .reply_to_message_id
            .clone()
            .unwrap_or_else(|| message.id.clone());
        let printed = self.printed.entry(key).or_default();
        let output = if printed.is_empty() {
            format!("assistant: {}", message.message)
        } else {
            // Only continue a reply whose visible prefix is unchanged.
            message.message.strip_prefix(printed.as_str())?.to_string()
        };
        if output.is_empty() || message.message.is_empty() {
            return None;
        }
        printed.clone_from(&message.message);
        self.wrote_this_turn = true;
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwplu_chat::protocol::MessageMetadata;
    use pretty_assertions::assert_eq;

    fn temporary(id: &str, text: &str) -> ChatMessage {
        let mut message = ChatMessage::temporary(Role::Assistant, text);
        message.metadata = MessageMetadata::reply_to("m-user");
        message.id = id.to_string();
        message
    }

    #[test]
    fn streamed_reply_prints_deltas_then_newline() {
        let mut printer = ReplyPrinter::new();
        let first = temporary("temp-1", "Hel");
        let grown = temporary("temp-1", "Hello");
        let mut durable = temporary("m-assist", "Hello");
        durable.is_temporary = false;

        let output: Vec<Option<String>> = vec![
            printer.render(&ChatEvent::MessageAppended { message: first }),
            printer.render(&ChatEvent::MessageUpdated { message: grown }),
            printer.render(&ChatEvent::MessageReplaced {
                previous_id: "temp-1".to_string(),
                message: durable,
            }),
            printer.render(&ChatEvent::TurnCompleted {
                user_message_id: Some("m-user".to_string()),
                success: true,
            }),
        ];
        assert_eq!(
            output,
            vec![
                Some("assistant: Hel".to_string()),
                Some("lo".to_string()),
                None,
                Some("\n".to_string()),
            ]
        );
    }

    #[test]
    fn user_messages_and_quiet_turns_print_nothing() {
        let mut printer = ReplyPrinter::new();
        let user = ChatMessage::temporary(Role::User, "Bonjour");
        assert_eq!(printer.render(&ChatEvent::MessageAppended { message: user }), None);
        assert_eq!(
            printer.render(&ChatEvent::TurnCompleted {
                user_message_id: None,
                success: false,
            }),
            None
        );
    }
}
