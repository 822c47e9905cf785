use crate::config::ApiKeyConfig;
use crate::error::{AppError, AppResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

/// An API key that passed admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedKey {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub name: String,
    pub rpm: u32,
    pub usage_count: u64,
    pub recent_requests: usize,
}

struct KeyState {
    config: ApiKeyConfig,
    recent: VecDeque<Instant>,
    usage_count: u64,
}

/// Admits requests per configured key under a trailing one-minute window.
pub struct ApiKeyManager {
    api_keys: Arc<RwLock<HashMap<String, KeyState>>>,
}

impl ApiKeyManager {
    pub fn new(keys: Vec<ApiKeyConfig>) -> Self {
        let mut api_keys = HashMap::new();
        for config in keys {
            if config.key.trim().is_empty() {
                continue;
            }
            api_keys.insert(
                config.key.clone(),
                KeyState {
                    config,
                    recent: VecDeque::new(),
                    usage_count: 0,
                },
            );
        }
        if api_keys.is_empty() {
            warn!("No API keys configured, every chat request will be rejected");
        }
        Self {
            api_keys: Arc::new(RwLock::new(api_keys)),
        }
    }

    /// 检查API密钥并记录本次请求
    pub fn admit(&self, api_key: &str) -> AppResult<AdmittedKey> {
        self.admit_at(api_key, Instant::now())
    }

    fn admit_at(&self, api_key: &str, now: Instant) -> AppResult<AdmittedKey> {
        let mut keys = self.api_keys.write();
        let state = keys
            .get_mut(api_key)
            .ok_or_else(|| AppError::Unauthorized("invalid API key".to_string()))?;

        while let Some(oldest) = state.recent.front() {
            if now.duration_since(*oldest) >= WINDOW {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        if state.recent.len() >= state.config.rpm as usize {
            let retry_after = state
                .recent
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(WINDOW);
            debug!("API key {} over its {} rpm quota", state.config.name, state.config.rpm);
            return Err(AppError::RateLimited {
                retry_after: Some(retry_after),
                detail: format!("API key `{}` exceeded {} requests per minute", state.config.name, state.config.rpm),
            });
        }

        state.recent.push_back(now);
        state.usage_count += 1;
        Ok(AdmittedKey {
            name: state.config.name.clone(),
            key: api_key.to_string(),
        })
    }

    /// 获取API密钥信息，不计入用量
    pub fn get_api_key_info(&self, api_key: &str) -> AppResult<ApiKeyInfo> {
        let keys = self.api_keys.read();
        let state = keys
            .get(api_key)
            .ok_or_else(|| AppError::Unauthorized("invalid API key".to_string()))?;
        Ok(Self::info(state))
    }

    fn info(state: &KeyState) -> ApiKeyInfo {
        ApiKeyInfo {
            name: state.config.name.clone(),
            rpm: state.config.rpm,
            usage_count: state.usage_count,
            recent_requests: state.recent.len(),
        }
    }

    /// 列出所有API密钥
    pub fn list_api_keys(&self) -> Vec<ApiKeyInfo> {
        let keys = self.api_keys.read();
        let mut infos: Vec<ApiKeyInfo> = keys.values().map(Self::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
