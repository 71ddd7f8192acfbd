//! Response decoding for both delivery modes.
//!
//! Streaming bodies follow a small line grammar, applied to every line:
//!
//! 1. an empty line is skipped;
//! 2. a leading `data: ` is stripped;
//! 3. what remains is skipped if blank, or if it is the `event: ping` heartbeat;
//! 4. otherwise it is parsed as a JSON event, and skipped if that fails.
//!
//! Only `text_chunk` events contribute; their `data.text` values are joined
//! in arrival order without a separator.

use futures_util::{Stream, StreamExt};
use log::{debug, trace};
use serde_json::Value;

use super::types::{DeliveryMode, Fields, InvocationResult, StreamEvent};
use crate::http::{FailureKind, RawResponse, TransportError};

pub const DATA_PREFIX: &str = "data: ";
pub const HEARTBEAT: &str = "event: ping";

/// Why a body could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    MalformedJson(String),
    MissingField(&'static str),
    UnexpectedType { field: &'static str, found: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedJson(msg) => write!(f, "malformed JSON body: {}", msg),
            DecodeError::MissingField(field) => write!(f, "missing required field '{}'", field),
            DecodeError::UnexpectedType { field, found } => {
                write!(f, "field '{}' should be an object, found {}", field, found)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// One line of the event stream, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Blank,
    Heartbeat,
    Event(StreamEvent),
    Unparsable,
}

pub fn classify_line(line: &str) -> StreamLine {
    if line.is_empty() {
        return StreamLine::Blank;
    }

    let content = line.strip_prefix(DATA_PREFIX).unwrap_or(line);
    if content.trim().is_empty() {
        return StreamLine::Blank;
    }
    if content == HEARTBEAT {
        return StreamLine::Heartbeat;
    }

    match serde_json::from_str::<StreamEvent>(content) {
        Ok(event) => StreamLine::Event(event),
        Err(_) => StreamLine::Unparsable,
    }
}

/// Splits a byte stream into lines without holding more than the current
/// partial line. Accepts `\n` and `\r\n` terminators.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for part in chunk.split_inclusive(|b| *b == b'\n') {
            self.pending.extend_from_slice(part);
            if part.last() == Some(&b'\n') {
                lines.push(Self::take_line(&mut self.pending));
            }
        }
        lines
    }

    /// The unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Self::take_line(&mut self.pending))
        }
    }

    fn take_line(pending: &mut Vec<u8>) -> String {
        let mut line = std::mem::take(pending);
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

/// Collects `text_chunk` texts.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
    chunks: usize,
}

impl TextAccumulator {
    pub fn feed_line(&mut self, line: &str) {
        match classify_line(line) {
            StreamLine::Event(event) => match event.text_chunk() {
                Some(text) => {
                    self.text.push_str(text);
                    self.chunks += 1;
                }
                None => trace!("Ignoring '{}' event", event.event),
            },
            StreamLine::Heartbeat => trace!("Heartbeat"),
            StreamLine::Unparsable => trace!("Skipping unparsable line: {}", line),
            StreamLine::Blank => {}
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn finish(self) -> String {
        self.text
    }
}

/// Decodes an event stream into the concatenated text.
/// An empty stream is a valid, empty result.
pub async fn decode_stream<S, B, E>(mut chunks: S) -> Result<String, E>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut splitter = LineSplitter::default();
    let mut text = TextAccumulator::default();

    while let Some(chunk) = chunks.next().await {
        for line in splitter.push(chunk?.as_ref()) {
            text.feed_line(&line);
        }
    }
    if let Some(line) = splitter.finish() {
        text.feed_line(&line);
    }

    debug!("Stream finished after {} text chunks", text.chunks());
    Ok(text.finish())
}

/// Decodes a blocking reply, which must carry `data.outputs` as an object.
pub fn decode_blocking(body: &[u8]) -> Result<Fields, DecodeError> {
    let mut value: Value =
        serde_json::from_slice(body).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

    match value.pointer_mut("/data/outputs").map(Value::take) {
        Some(Value::Object(outputs)) => Ok(outputs),
        Some(other) => Err(DecodeError::UnexpectedType {
            field: "data.outputs",
            found: json_type(&other).to_string(),
        }),
        None => Err(DecodeError::MissingField("data.outputs")),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn read_failure(error: TransportError) -> FailureKind {
    match error {
        TransportError::Timeout(_) => FailureKind::Timeout,
        other => FailureKind::Transient(other.to_string()),
    }
}

/// Decodes one successful response according to `mode`.
/// Every failure here is retryable.
///
/// A body that fails to decode is quoted in the failure, cut to
/// `snippet_chars` characters.
pub async fn decode(
    response: RawResponse,
    mode: DeliveryMode,
    snippet_chars: usize,
) -> Result<InvocationResult, FailureKind> {
    match mode {
        DeliveryMode::Streaming => decode_stream(response.chunks())
            .await
            .map(InvocationResult::Text)
            .map_err(read_failure),
        DeliveryMode::Blocking => {
            let body = response.bytes().await.map_err(read_failure)?;
            decode_blocking(&body)
                .map(InvocationResult::Outputs)
                .map_err(|e| {
                    let snippet: String = String::from_utf8_lossy(&body)
                        .chars()
                        .take(snippet_chars)
                        .collect();
                    FailureKind::Transient(format!("{}, body: {}", e, snippet))
                })
        }
    }
}
