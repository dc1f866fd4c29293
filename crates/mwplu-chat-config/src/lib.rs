//! Configuration model and layered config loading for the chat client.
//!
//! Covers the webhook endpoint, the reconciliation polling policy, the
//! user-facing strings rendered into the conversation, and local storage.

mod error;
mod loader;
mod model;

/// Public error type returned by config loading and validation APIs.
pub use error::ConfigError;
/// Layered config types and loader options.
pub use loader::{ConfigLayer, ConfigLayerSource, LayeredConfig, LayeredConfigOptions};
/// Configuration schema models.
pub use model::*;
