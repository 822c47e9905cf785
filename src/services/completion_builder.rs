//! `StreamEvent`s to OpenAI `chat.completion(.chunk)` objects.

use futures::stream::{self, Stream, StreamExt};
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    ArenaExtension, AssistantMessage, ChatChoice, ChatCompletionResponse, ChatMessageDelta,
    ChatUsage, StreamChoice, StreamChunk,
};
use crate::services::stream_translator::{EventStream, StreamEvent};
use crate::utils::{generate_completion_id, unix_timestamp};

pub const DONE_MARKER: &str = "[DONE]";

pub struct CompletionBuilder {
    id: String,
    created: u64,
    model: String,
    session_id: Option<String>,
}

impl CompletionBuilder {
    pub fn new(model: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            id: generate_completion_id(),
            created: unix_timestamp(),
            model: model.into(),
            session_id,
        }
    }

    fn chunk(&self, delta: ChatMessageDelta, finish_reason: Option<String>) -> StreamChunk {
        StreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn role_chunk(&self) -> StreamChunk {
        self.chunk(
            ChatMessageDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
                ..Default::default()
            },
            None,
        )
    }

    /// SSE `data:` payload for one event. Upstream errors become an OpenAI
    /// style error object in-band, since the HTTP status is already sent.
    pub fn event_data(&self, event: &StreamEvent) -> String {
        let chunk = match event {
            StreamEvent::TextDelta(text) => self.chunk(
                ChatMessageDelta {
                    content: Some(text.clone()),
                    ..Default::default()
                },
                None,
            ),
            StreamEvent::ReasoningDelta(text) => self.chunk(
                ChatMessageDelta {
                    reasoning_content: Some(text.clone()),
                    ..Default::default()
                },
                None,
            ),
            StreamEvent::ToolOrSearchEvent { kind, payload } => self.chunk(
                ChatMessageDelta {
                    x_arena: Some(ArenaExtension {
                        kind: kind.clone(),
                        payload: payload.clone(),
                    }),
                    ..Default::default()
                },
                None,
            ),
            StreamEvent::Finish(reason) => self.chunk(ChatMessageDelta::default(), Some(reason.clone())),
            StreamEvent::Error(detail) => {
                return json!({
                    "error": {
                        "message": detail,
                        "type": "upstream_error",
                    }
                })
                .to_string()
            }
        };
        serde_json::to_string(&chunk).unwrap_or_default()
    }

    /// Role chunk, one payload per event, then `[DONE]`.
    pub fn into_sse_data(self, events: EventStream) -> impl Stream<Item = String> + Send {
        let role = serde_json::to_string(&self.role_chunk()).unwrap_or_default();
        stream::once(async move { role })
            .chain(events.map(move |event| self.event_data(&event)))
            .chain(stream::once(async { DONE_MARKER.to_string() }))
    }

    /// Drains the events into one `chat.completion`.
    pub async fn aggregate(self, mut events: EventStream, prompt: &str) -> ApiResult<ChatCompletionResponse> {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut extensions = Vec::new();
        let mut errors = Vec::new();
        let mut finish_reason = None;

        while let Some(event) = events.next().await {
            match event {
                StreamEvent::TextDelta(text) => content.push_str(&text),
                StreamEvent::ReasoningDelta(text) => reasoning.push_str(&text),
                StreamEvent::ToolOrSearchEvent { kind, payload } => {
                    extensions.push(ArenaExtension { kind, payload })
                }
                StreamEvent::Error(detail) => errors.push(detail),
                StreamEvent::Finish(reason) => finish_reason = Some(reason),
            }
        }

        if content.is_empty() && !errors.is_empty() {
            return Err(ApiError::TransientNetwork(format!(
                "upstream stream failed: {}",
                errors.join("; ")
            )));
        }

        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(&content) + estimate_tokens(&reasoning);

        Ok(ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    x_arena: extensions,
                },
                finish_reason,
            }],
            usage: Some(ChatUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            session_id: self.session_id,
        })
    }
}

/// Rough count, about four characters per token.
fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    (chars + 3) / 4
}
