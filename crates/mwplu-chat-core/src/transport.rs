//! Webhook transport: one POST per user turn, never retried.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info};
use mwplu_chat_config::ChatConfig;
use mwplu_chat_protocol::WebhookRequest;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

/// Content types that are consumed incrementally.
const STREAMING_CONTENT_TYPES: &[&str] = &["text/event-stream", "application/x-ndjson"];

/// Successful webhook response, classified by how its body must be read.
pub enum WebhookResponse {
    /// Body is read incrementally as NDJSON.
    Stream(BoxStream<'static, Result<Bytes, TransportError>>),
    /// Body was read fully as text.
    Buffered(String),
}

impl std::fmt::Debug for WebhookResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookResponse::Stream(_) => f.write_str("WebhookResponse::Stream(..)"),
            WebhookResponse::Buffered(body) => f
                .debug_tuple("WebhookResponse::Buffered")
                .field(&body.len())
                .finish(),
        }
    }
}

/// Transport used to deliver a turn to the chat webhook.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Issue exactly one request for the turn.
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

/// True when the content type announces an incremental body.
pub fn is_streaming_content_type(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    STREAMING_CONTENT_TYPES
        .iter()
        .any(|expected| content_type.contains(expected))
}

/// Human-readable error from a failing response body.
///
/// JSON bodies yield their `message` field (or the JSON text itself), other
/// bodies their raw text. Unreadable bodies yield `generic`, and an empty
/// result falls back to `HTTP <status>`.
pub fn extract_error_message(
    status: u16,
    content_type: &str,
    body: Result<String, TransportError>,
    generic: &str,
) -> String {
    let message = match body {
        Ok(body) if content_type.contains("application/json") => {
            match serde_json::from_str::<Value>(&body) {
                Ok(value) => match value.get("message").and_then(Value::as_str) {
                    Some(message) if !message.is_empty() => message.to_string(),
                    _ => value.to_string(),
                },
                Err(_) => generic.to_string(),
            }
        }
        Ok(body) => body,
        Err(_) => generic.to_string(),
    };
    if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    }
}

/// reqwest-backed webhook client.
#[derive(Debug, Clone)]
pub struct HttpWebhookClient {
    client: reqwest::Client,
    url: String,
    generic_server_error: String,
}

impl HttpWebhookClient {
    /// Build a client for the configured webhook.
    pub fn from_config(config: &ChatConfig) -> Result<Self, TransportError> {
        let mut builder =
            reqwest::Client::builder().connect_timeout(config.webhook.connect_timeout());
        if let Some(timeout) = config.webhook.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self {
            client,
            url: config.webhook.url.clone(),
            generic_server_error: config.messages.generic_server_error.clone(),
        })
    }

    /// Client for an explicit URL with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            generic_server_error: mwplu_chat_config::MessagesConfig::default().generic_server_error,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookClient {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        debug!(
            "posting webhook turn (message_id={}, message_len={}, conversation_id={:?})",
            request.message_id,
            request.message.len(),
            request.conversation_id
        );
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        info!(
            "webhook responded (message_id={}, status={}, content_type={})",
            request.message_id,
            status.as_u16(),
            content_type
        );

        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|err| TransportError::Body(err.to_string()));
            let message = extract_error_message(
                status.as_u16(),
                &content_type,
                body,
                &self.generic_server_error,
            );
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if is_streaming_content_type(&content_type) {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|err| TransportError::Body(err.to_string())))
                .boxed();
            return Ok(WebhookResponse::Stream(stream));
        }

        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?;
        Ok(WebhookResponse::Buffered(body))
    }
}
