//! Chat turn client for the MWPLU zoning document assistant.
//!
//! This crate owns the webhook transport, body decoding, the message store,
//! persistence backends, and the turn reconciler that ties them together:
//! each user turn ends with exactly one durable, visible assistant reply.

pub mod decoder;
pub mod error;
mod event_bus;
pub mod persistence;
mod policy;
pub mod reconciler;
mod session;
pub mod store;
pub mod transport;

pub use decoder::{NdjsonDecoder, TextAccumulator, decode_buffered_body};
pub use error::{ChatError, PersistenceError, TransportError, ValidationError};
pub use event_bus::EventBus;
pub use persistence::{ChatPersistence, InMemoryPersistence, JsonlPersistence, NewMessage};
pub use policy::RetryPolicy;
pub use reconciler::{ConfirmedVia, TurnOutcome, TurnReconciler, TurnReport};
pub use session::{ChatSession, ChatStatus};
pub use store::MessageStore;
pub use transport::{HttpWebhookClient, WebhookResponse, WebhookTransport};

/// Re-exported so integrators can emit and observe events without a direct
/// protocol dependency.
pub use mwplu_chat_protocol::{ChatEvent, EventSink, NoopSink};
