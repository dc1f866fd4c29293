//! Broadcast fan-out of chat events to UI listeners.

use log::{debug, trace};
use mwplu_chat_protocol::{ChatEvent, EventSink};
use tokio::sync::broadcast;

/// Broadcast-backed [`EventSink`].
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus with the given channel buffer size.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        debug!("chat event bus initialized (buffer={})", buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: ChatEvent) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            trace!("chat event dropped without subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        bus.emit(ChatEvent::StreamingChanged { streaming: true });
        assert_eq!(
            receiver.recv().await.expect("event"),
            ChatEvent::StreamingChanged { streaming: true }
        );
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        EventBus::default().emit(ChatEvent::StreamingChanged { streaming: false });
    }
}
