//! Decoding of webhook bodies into assistant text.
//!
//! Two paths produce the same result, a single accumulated string:
//!
//! * [`NdjsonDecoder`] consumes a live byte stream, buffering partial lines
//!   and surfacing `item` deltas as they complete.
//! * [`decode_buffered_body`] handles a fully-read body: a single JSON object
//!   first, then NDJSON line splitting when the body is not one JSON value
//!   (servers that stream NDJSON under an `application/json` label).
//!
//! Malformed lines are skipped on both paths and never abort decoding.

use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use mwplu_chat_protocol::StreamEvent;
use serde_json::Value;

/// Accumulates text deltas and reports the final text once.
#[derive(Debug, Default, Clone)]
pub struct TextAccumulator {
    text: String,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Finish accumulation, invoking `on_content` only for non-empty text.
    pub fn finish<F>(self, on_content: F) -> String
    where
        F: FnOnce(&str),
    {
        if !self.text.is_empty() {
            on_content(&self.text);
        }
        self.text
    }

    /// Drain a stream of text chunks, then finish with `on_content`.
    pub async fn collect<S, F>(stream: S, on_content: F) -> String
    where
        S: Stream<Item = String>,
        F: FnOnce(&str),
    {
        let mut accumulator = Self::new();
        let mut stream = Box::pin(stream);
        while let Some(chunk) = stream.next().await {
            accumulator.push(&chunk);
        }
        accumulator.finish(on_content)
    }
}

/// Incremental NDJSON decoder for streamed webhook responses.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
    text: TextAccumulator,
    skipped: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the content deltas completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if let Some(delta) = self.decode_line(&line) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = self.buffer.split();
        self.decode_line(&line)
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        self.text.text()
    }

    /// Number of non-empty lines that could not be decoded.
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }

    pub fn into_text(self) -> String {
        self.text.finish(|_| {})
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<String> {
        let Ok(line) = std::str::from_utf8(raw) else {
            self.skipped += 1;
            warn!("skipping non-utf8 stream line (len={})", raw.len());
            return None;
        };
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => {
                let delta = event.delta()?.to_string();
                self.text.push(&delta);
                Some(delta)
            }
            Err(err) => {
                self.skipped += 1;
                debug!("skipping malformed stream line (len={}, error={})", line.len(), err);
                None
            }
        }
    }
}

/// Content carried by one decoded JSON payload, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// `{ "type": "item", "content": ... }`
    Item(String),
    /// `{ "response": ... }`
    Response(String),
    /// `{ "message": ... }`
    Message(String),
    /// Valid JSON without displayable content (`begin`/`end`, other shapes).
    Empty,
}

impl ResponsePayload {
    /// Classify a JSON value; `item.content` wins over `response` over `message`.
    pub fn from_value(value: &Value) -> Self {
        if value.get("type").and_then(Value::as_str) == Some("item")
            && let Some(content) = non_empty_str(value, "content")
        {
            return ResponsePayload::Item(content);
        }
        if let Some(response) = non_empty_str(value, "response") {
            return ResponsePayload::Response(response);
        }
        if let Some(message) = non_empty_str(value, "message") {
            return ResponsePayload::Message(message);
        }
        ResponsePayload::Empty
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            ResponsePayload::Item(text)
            | ResponsePayload::Response(text)
            | ResponsePayload::Message(text) => Some(text),
            ResponsePayload::Empty => None,
        }
    }
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// How a buffered body was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    SingleJson,
    Ndjson,
}

/// Result of decoding a fully-read body.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    pub format: BodyFormat,
    /// Accumulated assistant text; empty means nothing to display.
    pub text: String,
    /// Parsed single-JSON payload, when the body was one.
    pub payload: Option<Value>,
}

/// Decode a buffered (non-streamed) webhook body.
pub fn decode_buffered_body(raw: &str) -> DecodedBody {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            let text = ResponsePayload::from_value(&value)
                .content()
                .unwrap_or_default()
                .to_string();
            DecodedBody {
                format: BodyFormat::SingleJson,
                text,
                payload: Some(value),
            }
        }
        Err(err) => {
            debug!(
                "body is not a single JSON value, trying NDJSON (len={}, error={})",
                raw.len(),
                err
            );
            DecodedBody {
                format: BodyFormat::Ndjson,
                text: decode_ndjson_text(raw),
                payload: None,
            }
        }
    }
}

/// Concatenate content from every decodable NDJSON line.
pub fn decode_ndjson_text(raw: &str) -> String {
    let mut text = TextAccumulator::new();
    for line in raw.split('\n').map(str::trim).filter(|line| !line.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                if let Some(content) = ResponsePayload::from_value(&value).content() {
                    text.push(content);
                }
            }
            Err(err) => warn!("skipping malformed NDJSON line (len={}, error={})", line.len(), err),
        }
    }
    text.finish(|_| {})
}
