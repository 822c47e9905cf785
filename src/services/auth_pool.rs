use crate::error::{ApiError, ApiResult};
use crate::utils::token_preview;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable backing store for the rotation pool.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> ApiResult<Vec<String>>;
    fn save(&self, tokens: &[String]) -> ApiResult<()>;
}

/// Persists the pool under the `auth_tokens` key of the JSON config file,
/// leaving every other key untouched.
pub struct JsonFileTokenStore {
    path: PathBuf,
}

impl JsonFileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_document(&self) -> ApiResult<Value> {
        if !self.path.exists() {
            return Ok(Value::Object(Default::default()));
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl TokenStore for JsonFileTokenStore {
    fn load(&self) -> ApiResult<Vec<String>> {
        let document = self.read_document()?;
        let tokens = document
            .get("auth_tokens")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|t| !t.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(tokens)
    }

    fn save(&self, tokens: &[String]) -> ApiResult<()> {
        let mut document = self.read_document()?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| ApiError::ConfigError("config file is not a JSON object".to_string()))?;
        object.insert("auth_tokens".to_string(), serde_json::json!(tokens));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a half-written config.
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, serde_json::to_string_pretty(&document)?)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Auth token pool saved to {}", self.path.display());
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// In-memory store used when no config file backs the pool.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Vec<String>>,
}

impl MemoryTokenStore {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: Mutex::new(tokens),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> ApiResult<Vec<String>> {
        Ok(self.tokens.lock().clone())
    }

    fn save(&self, tokens: &[String]) -> ApiResult<()> {
        *self.tokens.lock() = tokens.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    tokens: Vec<String>,
    cursor: usize,
}

/// Round-robin pool of upstream session credentials.
///
/// All mutations run under one lock and are persisted before the lock is
/// released; a failed save is logged and never fails the caller.
pub struct AuthTokenPool {
    state: Mutex<PoolState>,
    store: Arc<dyn TokenStore>,
    fallback_cookie: String,
    browser_cookies: HashMap<String, String>,
}

impl AuthTokenPool {
    pub fn new(
        tokens: Vec<String>,
        store: Arc<dyn TokenStore>,
        fallback_cookie: impl Into<String>,
        browser_cookies: HashMap<String, String>,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(tokens.len());
        for token in tokens {
            if !token.trim().is_empty() && !unique.contains(&token) {
                unique.push(token);
            }
        }

        Self {
            state: Mutex::new(PoolState {
                tokens: unique,
                cursor: 0,
            }),
            store,
            fallback_cookie: fallback_cookie.into(),
            browser_cookies,
        }
    }

    /// Returns the token at the cursor and advances it.
    pub fn next(&self) -> ApiResult<String> {
        let mut state = self.state.lock();

        if state.tokens.is_empty() {
            let token = self.append_fallback(&mut state, &self.browser_cookies)?;
            state.cursor = 0;
            return Ok(token);
        }

        let index = state.cursor % state.tokens.len();
        let token = state.tokens[index].clone();
        state.cursor = (index + 1) % state.tokens.len();
        debug!("Using auth token #{} ({})", index, token_preview(&token));
        Ok(token)
    }

    /// Seeds an empty pool from a browser-session cookie map. A non-empty
    /// pool is left alone and its current token returned.
    pub fn fallback_from_cookie(&self, cookies: &HashMap<String, String>) -> ApiResult<String> {
        let mut state = self.state.lock();
        if !state.tokens.is_empty() {
            let index = state.cursor % state.tokens.len();
            return Ok(state.tokens[index].clone());
        }
        self.append_fallback(&mut state, cookies)
    }

    /// Appends a token seen opportunistically. Returns whether it was new.
    pub fn record_discovered(&self, token: &str) -> bool {
        let token = token.trim();
        if token.is_empty() {
            return false;
        }

        let mut state = self.state.lock();
        if state.tokens.iter().any(|t| t == token) {
            return false;
        }

        state.tokens.push(token.to_string());
        self.persist(&state.tokens);
        info!(
            "Recorded discovered auth token {} (pool size {})",
            token_preview(token),
            state.tokens.len()
        );
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_fallback(
        &self,
        state: &mut PoolState,
        cookies: &HashMap<String, String>,
    ) -> ApiResult<String> {
        let token = cookies
            .get(&self.fallback_cookie)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ApiError::AuthExhausted(format!(
                    "auth token pool is empty and no `{}` browser cookie is configured",
                    self.fallback_cookie
                ))
            })?
            .to_string();

        if !state.tokens.contains(&token) {
            state.tokens.push(token.clone());
            self.persist(&state.tokens);
            info!(
                "Auth token pool seeded from browser cookie `{}` ({})",
                self.fallback_cookie,
                token_preview(&token)
            );
        }
        Ok(token)
    }

    fn persist(&self, tokens: &[String]) {
        if let Err(e) = self.store.save(tokens) {
            warn!("Failed to persist auth token pool: {}", e);
        }
    }
}
