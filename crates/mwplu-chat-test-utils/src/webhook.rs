use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use mwplu_chat_core::{TransportError, WebhookResponse, WebhookTransport};
use mwplu_chat_protocol::WebhookRequest;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;

/// One canned webhook response.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Buffered(String),
    /// Body chunks delivered as a stream; an `Err` chunk fails the body.
    Stream(Vec<Result<Bytes, TransportError>>),
    Fail(TransportError),
}

impl ScriptedResponse {
    pub fn json(body: &str) -> Self {
        Self::Buffered(body.to_string())
    }

    /// Stream each string as its own chunk.
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from(chunk.into())))
                .collect(),
        )
    }

    pub fn status(status: u16, message: &str) -> Self {
        Self::Fail(TransportError::Status {
            status,
            message: message.to_string(),
        })
    }
}

/// NDJSON body made of `begin`, one `item` per delta, then `end`.
pub fn ndjson_lines(deltas: &[&str]) -> String {
    let mut lines = vec![json!({ "type": "begin" })];
    lines.extend(
        deltas
            .iter()
            .map(|delta| json!({ "type": "item", "content": delta })),
    );
    lines.push(json!({ "type": "end" }));
    lines
        .iter()
        .map(|line| format!("{line}\n"))
        .collect()
}

/// Webhook double that replays scripted responses and records requests.
#[derive(Default)]
pub struct ScriptedWebhook {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<WebhookRequest>>,
    delay: Option<Duration>,
}

impl ScriptedWebhook {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResponse>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Wait before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedWebhook {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().pop_front();
        match next {
            Some(ScriptedResponse::Buffered(body)) => Ok(WebhookResponse::Buffered(body)),
            Some(ScriptedResponse::Stream(chunks)) => {
                Ok(WebhookResponse::Stream(stream::iter(chunks).boxed()))
            }
            Some(ScriptedResponse::Fail(err)) => Err(err),
            None => Err(TransportError::Network("no scripted response left".to_string())),
        }
    }
}
