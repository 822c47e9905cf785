use crate::utils::unix_timestamp;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 会话信息
///
/// Maps a client-visible session id to the upstream evaluation it continues.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub session_id: String,
    pub api_key: String,
    pub evaluation_id: String,
    pub model_id: String,
    pub last_user_message_id: String,
    pub last_assistant_message_id: String,
    pub turns: usize,
    pub created_at: u64,
    pub last_used: u64,
}

/// Outcome of a successful turn, recorded after dispatch succeeds.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub evaluation_id: String,
    pub model_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStoreStats {
    pub api_key: String,
    pub total_sessions: usize,
    pub total_turns: usize,
}

/// 会话存储管理器
///
/// Sessions are keyed by (api key, session id) so one key can never resume
/// another key's conversation.
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<(String, String), ChatSession>>>,
    session_timeout: u64,
}

impl SessionStore {
    pub fn new(session_timeout: u64) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_timeout,
        }
    }

    /// Returns the live session for this key, if any.
    pub fn lookup(&self, api_key: &str, session_id: &str) -> Option<ChatSession> {
        self.lookup_at(api_key, session_id, unix_timestamp())
    }

    fn lookup_at(&self, api_key: &str, session_id: &str, now: u64) -> Option<ChatSession> {
        let sessions = self.sessions.read();
        sessions
            .get(&(api_key.to_string(), session_id.to_string()))
            .filter(|session| now.saturating_sub(session.last_used) <= self.session_timeout)
            .cloned()
    }

    /// Creates the session on its first turn and advances it afterwards.
    pub fn commit(&self, api_key: &str, session_id: &str, turn: TurnRecord) -> ChatSession {
        self.commit_at(api_key, session_id, turn, unix_timestamp())
    }

    fn commit_at(&self, api_key: &str, session_id: &str, turn: TurnRecord, now: u64) -> ChatSession {
        let mut sessions = self.sessions.write();
        let key = (api_key.to_string(), session_id.to_string());

        let session = sessions
            .entry(key)
            .and_modify(|session| {
                session.evaluation_id = turn.evaluation_id.clone();
                session.model_id = turn.model_id.clone();
                session.last_user_message_id = turn.user_message_id.clone();
                session.last_assistant_message_id = turn.assistant_message_id.clone();
                session.turns += 1;
                session.last_used = now;
            })
            .or_insert_with(|| {
                info!("Created chat session {} (evaluation {})", session_id, turn.evaluation_id);
                ChatSession {
                    session_id: session_id.to_string(),
                    api_key: api_key.to_string(),
                    evaluation_id: turn.evaluation_id.clone(),
                    model_id: turn.model_id.clone(),
                    last_user_message_id: turn.user_message_id.clone(),
                    last_assistant_message_id: turn.assistant_message_id.clone(),
                    turns: 1,
                    created_at: now,
                    last_used: now,
                }
            });

        debug!("Session {} now at turn {}", session_id, session.turns);
        session.clone()
    }

    /// 清理过期会话
    pub fn cleanup_expired_sessions(&self) -> usize {
        self.cleanup_expired_at(unix_timestamp())
    }

    fn cleanup_expired_at(&self, now: u64) -> usize {
        let mut sessions = self.sessions.write();
        let initial_count = sessions.len();
        sessions.retain(|_, session| now.saturating_sub(session.last_used) <= self.session_timeout);

        let cleaned = initial_count - sessions.len();
        if cleaned > 0 {
            info!("Cleaned {} expired chat sessions", cleaned);
        }
        cleaned
    }

    /// 获取API密钥的统计信息
    pub fn stats(&self, api_key: &str) -> SessionStoreStats {
        let sessions = self.sessions.read();
        let owned: Vec<&ChatSession> = sessions.values().filter(|s| s.api_key == api_key).collect();
        SessionStoreStats {
            api_key: api_key.to_string(),
            total_sessions: owned.len(),
            total_turns: owned.iter().map(|s| s.turns).sum(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(3600)
    }
}
