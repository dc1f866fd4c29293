//! Configuration schema for the chat client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Production chat webhook.
pub const DEFAULT_WEBHOOK_URL: &str = "https://n8n.automationdfy.com/webhook/mwplu/chat";

/// Root config for the chat client.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChatConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ChatConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> ChatConfigBuilder {
        ChatConfigBuilder::new()
    }
}

/// Builder for assembling a `ChatConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct ChatConfigBuilder {
    config: ChatConfig,
}

impl ChatConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: ChatConfig::default(),
        }
    }

    /// Replace the webhook configuration.
    pub fn webhook(mut self, webhook: WebhookConfig) -> Self {
        self.config.webhook = webhook;
        self
    }

    /// Override only the webhook URL.
    pub fn webhook_url(mut self, url: impl Into<String>) -> Self {
        self.config.webhook.url = url.into();
        self
    }

    /// Replace the reconciliation polling configuration.
    pub fn reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.config.reconcile = reconcile;
        self
    }

    /// Replace the user-facing message strings.
    pub fn messages(mut self, messages: MessagesConfig) -> Self {
        self.config.messages = messages;
        self
    }

    /// Replace the local storage configuration.
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    /// Finalize and return the built `ChatConfig`.
    pub fn build(self) -> ChatConfig {
        self.config
    }
}

/// Chat webhook endpoint and HTTP timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-request timeout; `None` lets long streams run to completion.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: default_webhook_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
        }
    }
}

impl WebhookConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

fn default_webhook_url() -> String {
    DEFAULT_WEBHOOK_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Polling window used to observe the server's own persistence of a reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    #[serde(default = "default_poll_window_ms")]
    pub poll_window_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_window_ms: default_poll_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ReconcileConfig {
    pub fn poll_window(&self) -> Duration {
        Duration::from_millis(self.poll_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_window_ms() -> u64 {
    3_000
}

fn default_poll_interval_ms() -> u64 {
    350
}

/// Localized strings rendered to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagesConfig {
    /// Prepended to the underlying error text in error replies.
    #[serde(default = "default_error_prefix")]
    pub error_prefix: String,
    /// Used when a failing response body cannot be read.
    #[serde(default = "default_generic_server_error")]
    pub generic_server_error: String,
    #[serde(default = "default_empty_message")]
    pub empty_message: String,
    #[serde(default = "default_missing_document")]
    pub missing_document: String,
    #[serde(default = "default_unauthenticated")]
    pub unauthenticated: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            error_prefix: default_error_prefix(),
            generic_server_error: default_generic_server_error(),
            empty_message: default_empty_message(),
            missing_document: default_missing_document(),
            unauthenticated: default_unauthenticated(),
        }
    }
}

impl MessagesConfig {
    /// Render the error reply shown in place of an assistant answer.
    pub fn error_reply(&self, detail: &str) -> String {
        format!("{}{detail}", self.error_prefix)
    }
}

fn default_error_prefix() -> String {
    "Désolé, une erreur s'est produite : ".to_string()
}

fn default_generic_server_error() -> String {
    "Erreur serveur".to_string()
}

fn default_empty_message() -> String {
    "Le message ne peut pas être vide".to_string()
}

fn default_missing_document() -> String {
    "ID du document manquant".to_string()
}

fn default_unauthenticated() -> String {
    "Utilisateur non authentifié".to_string()
}

/// Local persistence settings for the JSONL store.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageConfig {
    /// Root directory; in-memory storage is used when unset.
    #[serde(default)]
    pub path: Option<String>,
}
