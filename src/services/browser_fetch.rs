//! Browser tier: fetches executed inside a real browser context.
//!
//! The browser itself lives in a sidecar process; this module only defines
//! the narrow contract the dispatcher needs and an HTTP client for it.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// What the browser saw after its own challenge-solving loop.
#[derive(Debug, Clone, Default)]
pub struct NormalizedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Cookies present in the browser context after the fetch.
    pub cookies: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum BrowserFetchError {
    /// No browser can be used; the dispatcher cannot escalate.
    #[error("browser tier unavailable: {0}")]
    Unavailable(String),

    /// The challenge loop ran out of rounds.
    #[error("challenge not solved after {attempts} attempts")]
    ChallengeUnsolved { attempts: u32 },

    #[error("browser transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait BrowserFetchProvider: Send + Sync {
    async fn fetch(
        &self,
        method: &Method,
        url: &str,
        payload: &Value,
        headers: &HashMap<String, String>,
        max_challenge_attempts: u32,
    ) -> Result<NormalizedResponse, BrowserFetchError>;
}

/// Used when no browser sidecar is configured.
pub struct DisabledBrowserFetch;

#[async_trait]
impl BrowserFetchProvider for DisabledBrowserFetch {
    async fn fetch(
        &self,
        _method: &Method,
        _url: &str,
        _payload: &Value,
        _headers: &HashMap<String, String>,
        _max_challenge_attempts: u32,
    ) -> Result<NormalizedResponse, BrowserFetchError> {
        Err(BrowserFetchError::Unavailable(
            "no browser sidecar configured".to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarFetchResponse {
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    cookies: HashMap<String, String>,
    #[serde(default)]
    challenge_solved: Option<bool>,
    #[serde(default)]
    challenge_attempts: u32,
}

/// Forwards fetches to the browser sidecar's `/fetch` endpoint.
///
/// Concurrency is bounded by a semaphore sized to the number of browser
/// sessions; the permit lives only as long as the call, so it is released on
/// every exit path, cancellation included.
pub struct SidecarBrowserFetch {
    client: Client,
    base_url: String,
    sessions: Arc<Semaphore>,
}

impl SidecarBrowserFetch {
    pub fn new(client: Client, base_url: impl Into<String>, max_sessions: usize) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }
}

#[async_trait]
impl BrowserFetchProvider for SidecarBrowserFetch {
    async fn fetch(
        &self,
        method: &Method,
        url: &str,
        payload: &Value,
        headers: &HashMap<String, String>,
        max_challenge_attempts: u32,
    ) -> Result<NormalizedResponse, BrowserFetchError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| BrowserFetchError::Unavailable("browser pool closed".to_string()))?;

        debug!("Browser fetch {} {} (challenge rounds {})", method, url, max_challenge_attempts);

        let response = self
            .client
            .post(format!("{}/fetch", self.base_url))
            .json(&json!({
                "method": method.as_str(),
                "url": url,
                "body": payload.to_string(),
                "headers": headers,
                "maxChallengeAttempts": max_challenge_attempts,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    BrowserFetchError::Unavailable(e.to_string())
                } else {
                    BrowserFetchError::Transport(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            let detail = response.text().await.unwrap_or_default();
            return Err(BrowserFetchError::Unavailable(detail));
        }
        if !response.status().is_success() {
            return Err(BrowserFetchError::Transport(format!(
                "sidecar returned {}",
                response.status()
            )));
        }

        let result: SidecarFetchResponse = response
            .json()
            .await
            .map_err(|e| BrowserFetchError::Transport(e.to_string()))?;

        if result.challenge_solved == Some(false) {
            return Err(BrowserFetchError::ChallengeUnsolved {
                attempts: result.challenge_attempts.max(max_challenge_attempts),
            });
        }

        info!("Browser fetch finished with status {}", result.status);
        Ok(NormalizedResponse {
            status: result.status,
            headers: result.headers,
            body: result.body,
            cookies: result.cookies,
        })
    }
}
