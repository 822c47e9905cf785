//! Upstream `tag:payload` line protocol to `StreamEvent`s.
//!
//! One translator per logical request. Input bytes are buffered until a full
//! line is available, so records (and UTF-8 sequences) may be split across
//! reads. The output always ends in exactly one `Finish`.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::error::ApiResult;

pub const TAG_TEXT: &str = "a0";
pub const TAG_REASONING: &str = "ag";
pub const TAG_CITATIONS: &str = "ac";
pub const TAG_MEDIA: &str = "a2";
pub const TAG_ERROR: &str = "a3";
pub const TAG_FINISH: &str = "ad";

/// Reason used when the transport ends without an explicit finish record.
pub const SYNTHETIC_FINISH_REASON: &str = "stop";

pub type ByteStream = Pin<Box<dyn Stream<Item = ApiResult<Bytes>> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolOrSearchEvent { kind: String, payload: Value },
    Finish(String),
    Error(String),
}

impl StreamEvent {
    pub fn is_finish(&self) -> bool {
        matches!(self, StreamEvent::Finish(_))
    }
}

/// Longest partial line buffered while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct StreamTranslator {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    finished: bool,
}

impl Default for StreamTranslator {
    fn default() -> Self {
        Self::with_line_limit(MAX_LINE_BYTES)
    }
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_line_limit(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds raw bytes; returns the events for every line completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            if let Some(event) = self.translate_line(&line) {
                events.push(event);
            }
            start = end + 1;
            cursor = start;
            if self.finished {
                self.buffer.clear();
                self.scanned = 0;
                return events;
            }
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            warn!("Upstream record exceeds {} bytes without a newline", self.max_line);
            self.buffer.clear();
            self.scanned = 0;
            self.finished = true;
            events.push(StreamEvent::Error(format!(
                "upstream record exceeds {} bytes",
                self.max_line
            )));
            events.push(StreamEvent::Finish(SYNTHETIC_FINISH_REASON.to_string()));
        }
        events
    }

    /// Flushes a trailing partial line and guarantees a terminal `Finish`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            if let Some(event) = self.translate_raw(&rest) {
                events.push(event);
            }
        }
        if !self.finished {
            debug!("Upstream stream ended without finish record, synthesizing one");
            self.finished = true;
            events.push(StreamEvent::Finish(SYNTHETIC_FINISH_REASON.to_string()));
        }
        events
    }

    fn translate_raw(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = String::from_utf8_lossy(raw);
        self.translate_line(&line)
    }

    /// Translates one complete line. Unknown tags and blank lines yield nothing.
    pub fn translate_line(&mut self, line: &str) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return None;
        }
        let (tag, raw_payload) = line.split_once(':')?;
        let payload = parse_payload(raw_payload);

        let event = match tag.trim() {
            TAG_TEXT => StreamEvent::TextDelta(payload_text(&payload)),
            TAG_REASONING => StreamEvent::ReasoningDelta(payload_text(&payload)),
            TAG_CITATIONS => StreamEvent::ToolOrSearchEvent {
                kind: "citations".to_string(),
                payload,
            },
            TAG_MEDIA => StreamEvent::ToolOrSearchEvent {
                kind: "media".to_string(),
                payload,
            },
            TAG_ERROR => StreamEvent::Error(payload_text(&payload)),
            TAG_FINISH => {
                self.finished = true;
                let reason = payload
                    .get("finishReason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .unwrap_or(SYNTHETIC_FINISH_REASON);
                StreamEvent::Finish(reason.to_string())
            }
            other => {
                debug!("Ignoring upstream record with tag `{}`", other);
                return None;
            }
        };
        Some(event)
    }
}

/// JSON when it parses, otherwise the bare string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

/// Lazily translates a byte stream. Stops pulling bytes once `Finish` is seen.
pub fn translate(body: ByteStream) -> EventStream {
    let state = (body, StreamTranslator::new(), VecDeque::new(), false);

    Box::pin(stream::unfold(
        state,
        |(mut body, mut translator, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (body, translator, pending, done)));
                }
                if done {
                    return None;
                }

                match body.next().await {
                    Some(Ok(chunk)) => pending.extend(translator.push(&chunk)),
                    Some(Err(e)) => {
                        warn!("Upstream stream interrupted: {}", e);
                        pending.push_back(StreamEvent::Error(e.to_string()));
                        pending.extend(translator.finish());
                        done = true;
                    }
                    None => {
                        pending.extend(translator.finish());
                        done = true;
                    }
                }

                if translator.is_finished() {
                    done = true;
                }
            }
        },
    ))
}
