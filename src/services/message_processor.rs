use crate::error::{AppError, AppResult};
use crate::models::{ChatMessage, ChatMessageContent};
use crate::services::session_store::{ChatSession, TurnRecord};
use crate::utils::generate_uuid;
use serde_json::{json, Value};

/// One upstream turn ready to dispatch.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub url: String,
    pub payload: Value,
    pub turn: TurnRecord,
}

/// 消息处理器
pub struct MessageProcessor;

impl MessageProcessor {
    /// 预处理聊天消息
    ///
    /// A continuing session already holds the history upstream, so only the
    /// trailing user turn is sent. A fresh evaluation gets the whole
    /// conversation folded into one prompt.
    pub fn prepare_prompt(messages: &[ChatMessage], continuing: bool) -> AppResult<String> {
        let processed: Vec<ProcessedMessage> = messages
            .iter()
            .map(|message| ProcessedMessage {
                role: message.role.clone(),
                text: Self::extract_text_content(&message.content),
            })
            .filter(|message| !message.text.trim().is_empty())
            .collect();

        let last_user = processed
            .iter()
            .rposition(|m| m.role == "user")
            .ok_or_else(|| AppError::InvalidRequest("messages must contain a user message".to_string()))?;

        if continuing {
            return Ok(processed[last_user].text.clone());
        }

        let merged_blocks = Self::merge_same_role_messages(processed);
        if merged_blocks.len() == 1 {
            return Ok(merged_blocks[0].text.clone());
        }
        Ok(Self::format_transcript(&merged_blocks))
    }

    /// 从内容中提取文本
    fn extract_text_content(content: &ChatMessageContent) -> String {
        match content {
            ChatMessageContent::Text(text) => text.clone(),
            ChatMessageContent::Array(parts) => parts
                .iter()
                .filter(|part| part.content_type == "text")
                .filter_map(|part| part.text.clone())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// 合并连续相同角色的消息
    fn merge_same_role_messages(messages: Vec<ProcessedMessage>) -> Vec<ProcessedMessage> {
        let mut merged_blocks: Vec<ProcessedMessage> = Vec::new();
        for message in messages {
            match merged_blocks.last_mut() {
                Some(current) if current.role == message.role => {
                    current.text = format!("{}\n\n{}", current.text, message.text);
                }
                _ => merged_blocks.push(message),
            }
        }
        merged_blocks
    }

    fn format_transcript(blocks: &[ProcessedMessage]) -> String {
        blocks
            .iter()
            .map(|block| format!("{}: {}", block.role, block.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Builds the evaluation payload. A live session continues its evaluation
    /// and links the new user message to the previous assistant reply.
    pub fn build_evaluation(
        base_url: &str,
        model_id: &str,
        prompt: &str,
        session: Option<&ChatSession>,
    ) -> PreparedTurn {
        let base_url = base_url.trim_end_matches('/');
        let user_message_id = generate_uuid();
        let assistant_message_id = generate_uuid();

        let (evaluation_id, url, parents) = match session {
            Some(session) => (
                session.evaluation_id.clone(),
                format!(
                    "{}/nextjs-api/stream/post-to-evaluation/{}",
                    base_url, session.evaluation_id
                ),
                vec![session.last_assistant_message_id.clone()],
            ),
            None => (
                generate_uuid(),
                format!("{}/nextjs-api/stream/create-evaluation", base_url),
                Vec::new(),
            ),
        };

        let payload = json!({
            "id": evaluation_id,
            "mode": "direct",
            "modelAId": model_id,
            "userMessageId": user_message_id,
            "modelAMessageId": assistant_message_id,
            "messages": [
                {
                    "id": user_message_id,
                    "role": "user",
                    "content": prompt,
                    "experimental_attachments": [],
                    "parentMessageIds": parents,
                    "participantPosition": "a",
                    "modelId": Value::Null,
                    "evaluationSessionId": evaluation_id,
                    "status": "pending",
                    "failureReason": Value::Null,
                },
                {
                    "id": assistant_message_id,
                    "role": "assistant",
                    "content": "",
                    "experimental_attachments": [],
                    "parentMessageIds": [user_message_id],
                    "participantPosition": "a",
                    "modelId": model_id,
                    "evaluationSessionId": evaluation_id,
                    "status": "pending",
                    "failureReason": Value::Null,
                }
            ],
            "modality": "chat",
        });

        PreparedTurn {
            url,
            payload,
            turn: TurnRecord {
                evaluation_id,
                model_id: model_id.to_string(),
                user_message_id,
                assistant_message_id,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ProcessedMessage {
    role: String,
    text: String,
}
