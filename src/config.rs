use crate::error::ApiResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";
pub const AUTH_COOKIE_NAME: &str = "arena-auth-prod-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub config_file: String,
    pub server: ServerConfig,
    pub arena: ArenaConfig,
    pub retry: RetryConfig,
    pub api_keys: Vec<ApiKeyConfig>,
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub base_url: String,
    pub user_agent: String,
    pub auth_cookie_name: String,
    pub auth_tokens: Vec<String>,
    pub browser_cookies: HashMap<String, String>,
    pub cf_clearance: Option<String>,
    pub cf_bm: Option<String>,
    pub cfuvid: Option<String>,
    pub provisional_user_id: Option<String>,
    pub recaptcha_site_key: String,
    pub recaptcha_action: String,
    pub recaptcha_token_ttl_secs: u64,
    pub strict_models: Vec<String>,
    pub browser_sidecar_url: Option<String>,
    pub browser_max_sessions: usize,
    pub request_timeout_secs: u64,
    pub session_timeout_secs: u64,
}

/// Per-kind retry budgets and backoff bounds for one logical request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub recaptcha_retries: u32,
    pub rate_limit_retries: u32,
    pub transient_retries: u32,
    pub malformed_retries: u32,
    pub browser_attempts: u32,
    pub challenge_attempts: u32,
    pub model_challenge_attempts: HashMap<String, u32>,
    pub recaptcha_retry_delay_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub backoff_jitter_ms: u64,
    pub max_rate_limit_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default = "default_rpm")]
    pub rpm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    #[serde(alias = "publicname")]
    pub public_name: String,
    pub id: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

fn default_rpm() -> u32 {
    60
}

/// Shape of the flat JSON config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    auth_token: Option<String>,
    auth_tokens: Vec<String>,
    browser_cookies: HashMap<String, String>,
    cf_clearance: Option<String>,
    cf_bm: Option<String>,
    cfuvid: Option<String>,
    provisional_user_id: Option<String>,
    user_agent: Option<String>,
    recaptcha_site_key: Option<String>,
    recaptcha_action: Option<String>,
    recaptcha_token_ttl_secs: Option<u64>,
    strict_models: Option<Vec<String>>,
    browser_sidecar_url: Option<String>,
    browser_max_sessions: Option<usize>,
    chrome_fetch_recaptcha_max_attempts: Option<u32>,
    model_challenge_attempts: HashMap<String, u32>,
    recaptcha_retries: Option<u32>,
    rate_limit_retries: Option<u32>,
    transient_retries: Option<u32>,
    malformed_retries: Option<u32>,
    browser_attempts: Option<u32>,
    backoff_floor_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
    max_rate_limit_wait_secs: Option<u64>,
    api_keys: Vec<ApiKeyConfig>,
    models: Vec<ModelEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            config_file: "config.json".to_string(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                cors_origins: vec!["*".to_string()],
            },
            arena: ArenaConfig::default(),
            retry: RetryConfig::default(),
            api_keys: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://lmarena.ai".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            auth_cookie_name: AUTH_COOKIE_NAME.to_string(),
            auth_tokens: Vec::new(),
            browser_cookies: HashMap::new(),
            cf_clearance: None,
            cf_bm: None,
            cfuvid: None,
            provisional_user_id: None,
            recaptcha_site_key: "6Led_uYrAAAAAKjxDIF58fgFtX3t8loNAK85bW9I".to_string(),
            recaptcha_action: "chat_submit".to_string(),
            recaptcha_token_ttl_secs: 110,
            strict_models: vec!["gemini-3-pro-grounding".to_string()],
            browser_sidecar_url: None,
            browser_max_sessions: 1,
            request_timeout_secs: 120,
            session_timeout_secs: 3600,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            recaptcha_retries: 2,
            rate_limit_retries: 3,
            transient_retries: 3,
            malformed_retries: 1,
            browser_attempts: 3,
            challenge_attempts: 3,
            model_challenge_attempts: HashMap::new(),
            recaptcha_retry_delay_ms: 500,
            backoff_floor_ms: 1000,
            backoff_ceiling_ms: 30_000,
            backoff_jitter_ms: 250,
            max_rate_limit_wait_secs: 120,
        }
    }
}

impl ArenaConfig {
    /// Strict models never take the Direct tier. Entries name whole models,
    /// compared case-insensitively.
    pub fn is_strict_model(&self, model: &str) -> bool {
        let model = model.trim();
        self.strict_models
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .any(|entry| entry.eq_ignore_ascii_case(model))
    }
}

impl Config {
    pub fn load() -> ApiResult<Self> {
        let mut config = Config::default();

        if let Ok(path) = env::var("CONFIG_FILE") {
            config.config_file = path;
        }

        let file = Self::read_file(&config.config_file)?;
        config.apply_file(file);

        // 从环境变量加载配置
        if let Ok(port) = env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| crate::error::ApiError::ConfigError(format!("invalid PORT: {}", e)))?;
        }

        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }

        if let Ok(env_type) = env::var("ENVIRONMENT") {
            config.environment = env_type;
        }

        if let Ok(base_url) = env::var("ARENA_BASE_URL") {
            config.arena.base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Ok(url) = env::var("BROWSER_SIDECAR_URL") {
            config.arena.browser_sidecar_url = Some(url.trim_end_matches('/').to_string());
        }

        Ok(config)
    }

    fn read_file(path: &str) -> ApiResult<FileConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Json).required(false))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    fn apply_file(&mut self, file: FileConfig) {
        let arena = &mut self.arena;
        let retry = &mut self.retry;

        arena.auth_tokens = file.auth_tokens;
        // Legacy single-token key goes first in rotation order.
        if let Some(token) = file.auth_token.filter(|t| !t.trim().is_empty()) {
            if !arena.auth_tokens.contains(&token) {
                arena.auth_tokens.insert(0, token);
            }
        }
        arena.auth_tokens.retain(|t| !t.trim().is_empty());
        arena.browser_cookies = file.browser_cookies;
        arena.cf_clearance = file.cf_clearance.filter(|v| !v.is_empty());
        arena.cf_bm = file.cf_bm.filter(|v| !v.is_empty());
        arena.cfuvid = file.cfuvid.filter(|v| !v.is_empty());
        arena.provisional_user_id = file.provisional_user_id.filter(|v| !v.is_empty());

        if let Some(ua) = file.user_agent.filter(|v| !v.trim().is_empty()) {
            arena.user_agent = ua;
        }
        if let Some(key) = file.recaptcha_site_key {
            arena.recaptcha_site_key = key;
        }
        if let Some(action) = file.recaptcha_action {
            arena.recaptcha_action = action;
        }
        if let Some(ttl) = file.recaptcha_token_ttl_secs {
            arena.recaptcha_token_ttl_secs = ttl;
        }
        if let Some(strict) = file.strict_models {
            arena.strict_models = strict;
        }
        if let Some(url) = file.browser_sidecar_url.filter(|v| !v.trim().is_empty()) {
            arena.browser_sidecar_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(sessions) = file.browser_max_sessions {
            arena.browser_max_sessions = sessions.max(1);
        }

        if let Some(attempts) = file.chrome_fetch_recaptcha_max_attempts {
            retry.challenge_attempts = attempts.max(1);
        }
        retry.model_challenge_attempts = file.model_challenge_attempts;
        if let Some(n) = file.recaptcha_retries {
            retry.recaptcha_retries = n;
        }
        if let Some(n) = file.rate_limit_retries {
            retry.rate_limit_retries = n;
        }
        if let Some(n) = file.transient_retries {
            retry.transient_retries = n;
        }
        if let Some(n) = file.malformed_retries {
            retry.malformed_retries = n;
        }
        if let Some(n) = file.browser_attempts {
            retry.browser_attempts = n;
        }
        if let Some(ms) = file.backoff_floor_ms {
            retry.backoff_floor_ms = ms;
        }
        if let Some(ms) = file.backoff_ceiling_ms {
            retry.backoff_ceiling_ms = ms.max(retry.backoff_floor_ms);
        }
        if let Some(secs) = file.max_rate_limit_wait_secs {
            retry.max_rate_limit_wait_secs = secs;
        }

        self.api_keys = file.api_keys;
        self.models = file.models;
    }
}
