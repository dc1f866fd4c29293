//! Test helpers shared across MWPLU chat crates.

pub mod persistence;
pub mod webhook;

pub use persistence::{ScriptedPersistence, assistant_reply};
pub use webhook::{ScriptedResponse, ScriptedWebhook, ndjson_lines};
