//! Wire protocol and domain types for MWPLU chat turns.
//!
//! Everything a webhook, a persistence backend, or a UI needs to agree on
//! lives here: chat messages and their metadata, the webhook request and its
//! NDJSON stream events, the finalize-turn RPC shapes, and store events.

mod event;
mod message;
mod webhook;

pub use event::{ChatEvent, EventSink, NoopSink};
pub use message::{
    ChatMessage, Conversation, ConversationId, LOCAL_ID_PREFIX, MessageId, MessageMetadata, Role,
    TEMP_ID_PREFIX,
};
pub use webhook::{FinalizeTurnRequest, FinalizeTurnResult, StreamEvent, WebhookRequest};
