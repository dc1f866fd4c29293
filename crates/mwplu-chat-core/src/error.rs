//! Error types for chat turns, transport, and persistence.

use mwplu_chat_protocol::MessageId;
use thiserror::Error;

/// Errors returned by chat session and turn operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Input rejected before any network call.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Webhook returned a non-2xx status or could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    /// The server's own reply was not observed within the polling window.
    #[error("no server reply for message {user_message_id} after {attempts} attempts")]
    ReconciliationTimeout {
        user_message_id: MessageId,
        attempts: u32,
    },
}

/// Input validation failures. Display strings are the user-facing texts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    EmptyMessage(String),
    #[error("{0}")]
    MissingDocument(String),
    #[error("{0}")]
    Unauthenticated(String),
}

/// Webhook transport failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Non-2xx response; `message` is extracted from the body.
    #[error("{message}")]
    Status { status: u16, message: String },
    /// Connection, TLS, or timeout failure before a response arrived.
    #[error("{0}")]
    Network(String),
    /// The response body failed while being read.
    #[error("{0}")]
    Body(String),
}

/// Errors returned by persistence backends.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(u32),
    #[error("missing conversation metadata in {0}")]
    MissingMetadata(String),
    /// Failure reported by a remote backend.
    #[error("{0}")]
    Backend(String),
}
