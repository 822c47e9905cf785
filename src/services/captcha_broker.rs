//! reCAPTCHA v3 token broker.
//!
//! Every refresh hands out a newly minted token: a token goes to one logical
//! request only, and the dispatcher carries it across retries that did not
//! reject it. Tokens older than the configured TTL are no longer fresh.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ArenaConfig, RetryConfig};
use crate::error::{ApiError, ApiResult};
use crate::models::Tier;
use crate::utils::token_preview;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteKeyAction {
    pub site_key: String,
    pub action: String,
}

impl SiteKeyAction {
    pub fn new(site_key: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            action: action.into(),
        }
    }
}

/// One way of minting a token. Minters form an ordered fallback chain.
#[async_trait]
pub trait CaptchaMinter: Send + Sync {
    fn name(&self) -> &str;

    /// Tier this minter is closest to, used to honour the caller's preference.
    fn tier(&self) -> Tier;

    async fn mint(&self, key: &SiteKeyAction) -> ApiResult<String>;
}

/// A token and the instant it was minted (or received from the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaToken {
    pub value: String,
    pub minted_at: Instant,
}

impl CaptchaToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            minted_at: Instant::now(),
        }
    }
}

pub struct CaptchaTokenBroker {
    minters: Vec<Arc<dyn CaptchaMinter>>,
    locks: Mutex<HashMap<SiteKeyAction, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
    site_key_action: SiteKeyAction,
    default_budget: u32,
    model_budgets: HashMap<String, u32>,
    forced_refreshes: AtomicU64,
}

impl CaptchaTokenBroker {
    pub fn new(minters: Vec<Arc<dyn CaptchaMinter>>, arena: &ArenaConfig, retry: &RetryConfig) -> Self {
        Self {
            minters,
            locks: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(arena.recaptcha_token_ttl_secs),
            site_key_action: SiteKeyAction::new(&arena.recaptcha_site_key, &arena.recaptcha_action),
            default_budget: retry.challenge_attempts.max(1),
            model_budgets: retry
                .model_challenge_attempts
                .iter()
                .map(|(model, budget)| (model.to_lowercase(), *budget))
                .collect(),
            forced_refreshes: AtomicU64::new(0),
        }
    }

    /// The configured (site key, action) pair for chat submissions.
    pub fn site_key_action(&self) -> &SiteKeyAction {
        &self.site_key_action
    }

    /// Challenge rounds the browser tier may spend for this model.
    pub fn attempt_budget(&self, model: &str) -> u32 {
        self.model_budgets
            .get(&model.to_lowercase())
            .copied()
            .filter(|budget| *budget > 0)
            .unwrap_or(self.default_budget)
    }

    /// Number of forced refreshes served so far.
    pub fn forced_refresh_count(&self) -> u64 {
        self.forced_refreshes.load(Ordering::Relaxed)
    }

    /// Whether a held token is still inside the TTL.
    pub fn is_fresh(&self, token: &CaptchaToken) -> bool {
        token.minted_at.elapsed() < self.ttl
    }

    /// Mints a token no other request has seen. Mints for one key are
    /// serialised so a burst of rejections does not flood the minters.
    pub async fn refresh(&self, key: &SiteKeyAction, force_new: bool, prefer: Tier) -> ApiResult<CaptchaToken> {
        if force_new {
            self.forced_refreshes.fetch_add(1, Ordering::Relaxed);
            debug!("Forced captcha refresh for action {}", key.action);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let value = self.mint(key, prefer).await?;
        Ok(CaptchaToken::new(value))
    }

    fn key_lock(&self, key: &SiteKeyAction) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn mint(&self, key: &SiteKeyAction, prefer: Tier) -> ApiResult<String> {
        let mut chain: Vec<&Arc<dyn CaptchaMinter>> = self.minters.iter().collect();
        // Stable sort keeps the configured order within each tier.
        chain.sort_by_key(|minter| minter.tier() != prefer);

        let mut failures = Vec::new();
        for minter in chain {
            match minter.mint(key).await {
                Ok(token) if !token.trim().is_empty() => {
                    info!(
                        "Minted captcha token {} via {}",
                        token_preview(&token),
                        minter.name()
                    );
                    return Ok(token);
                }
                Ok(_) => failures.push(format!("{}: empty token", minter.name())),
                Err(e) => {
                    warn!("Captcha minter {} failed: {}", minter.name(), e);
                    failures.push(format!("{}: {}", minter.name(), e));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no captcha minter configured".to_string());
        }
        Err(ApiError::CaptchaMint(failures.join("; ")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarMintMode {
    /// Lightweight mint inside an already-open page.
    Page,
    /// Full browser context with its own navigation.
    Context,
}

#[derive(Debug, Deserialize)]
struct SidecarMintResponse {
    token: Option<String>,
    error: Option<String>,
}

/// Mints tokens through the browser sidecar's HTTP API.
pub struct SidecarCaptchaMinter {
    client: Client,
    base_url: String,
    mode: SidecarMintMode,
    name: String,
}

impl SidecarCaptchaMinter {
    pub fn new(client: Client, base_url: impl Into<String>, mode: SidecarMintMode) -> Self {
        let name = match mode {
            SidecarMintMode::Page => "sidecar-page",
            SidecarMintMode::Context => "sidecar-context",
        };
        Self {
            client,
            base_url: base_url.into(),
            mode,
            name: name.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        match self.mode {
            SidecarMintMode::Page => format!("{}/recaptcha/page", self.base_url),
            SidecarMintMode::Context => format!("{}/recaptcha/context", self.base_url),
        }
    }
}

#[async_trait]
impl CaptchaMinter for SidecarCaptchaMinter {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> Tier {
        match self.mode {
            SidecarMintMode::Page => Tier::Direct,
            SidecarMintMode::Context => Tier::Browser,
        }
    }

    async fn mint(&self, key: &SiteKeyAction) -> ApiResult<String> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&json!({
                "siteKey": key.site_key,
                "action": key.action,
            }))
            .send()
            .await
            .map_err(|e| ApiError::CaptchaMint(format!("{}: {}", self.name, e)))?;

        let status = response.status();
        let body: SidecarMintResponse = response
            .json()
            .await
            .map_err(|e| ApiError::CaptchaMint(format!("{}: {}", self.name, e)))?;

        match body.token.filter(|t| !t.is_empty()) {
            Some(token) if status.is_success() => Ok(token),
            _ => Err(ApiError::CaptchaMint(format!(
                "{} returned {}: {}",
                self.name,
                status,
                body.error.unwrap_or_else(|| "no token".to_string())
            ))),
        }
    }
}
