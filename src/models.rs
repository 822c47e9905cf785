use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// OpenAI兼容的聊天请求结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: Option<bool>,
    #[serde(alias = "conversation_id")]
    pub session_id: Option<String>,
    #[serde(rename = "recaptchaV3Token", alias = "recaptcha_token")]
    pub recaptcha_token: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ChatMessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatMessageContent {
    Text(String),
    Array(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
    pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: Option<String>,
}

// OpenAI兼容的响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub x_arena: Vec<ArenaExtension>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_arena: Option<ArenaExtension>,
}

/// Provider-specific payload (search citations, media) surfaced next to the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaExtension {
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// 流式响应数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<String>,
}

/// Delivery tier of one physical fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Direct,
    Browser,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Direct => write!(f, "direct"),
            Tier::Browser => write!(f, "browser"),
        }
    }
}

impl Default for ChatCompletionRequest {
    fn default() -> Self {
        Self {
            model: None,
            messages: vec![],
            stream: Some(false),
            session_id: None,
            recaptcha_token: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accepts_aliases() {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": true,
            "conversation_id": "conv-1",
            "recaptchaV3Token": "client-token"
        }))
        .unwrap();

        assert_eq!(request.session_id.as_deref(), Some("conv-1"));
        assert_eq!(request.recaptcha_token.as_deref(), Some("client-token"));
        assert_eq!(request.stream, Some(true));
    }

    #[test]
    fn test_default_request_is_not_streaming() {
        let request = ChatCompletionRequest::default();
        assert_eq!(request.stream, Some(false));
        assert!(request.messages.is_empty());
    }

    #[test]
    fn test_delta_omits_empty_fields() {
        let delta = ChatMessageDelta {
            content: Some("Hi".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value, serde_json::json!({"content": "Hi"}));
    }
}
