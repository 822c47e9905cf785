use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ArenaConfig;
use crate::error::{ApiError, ApiResult};
use crate::services::stream_translator::ByteStream;

/// Status, headers and a still-unread body of a Direct-tier response.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

/// Plain HTTP transport for the Direct tier.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn send(
        &self,
        method: &Method,
        url: &str,
        payload: &Value,
        headers: &HeaderMap,
    ) -> ApiResult<UpstreamResponse>;
}

pub struct ReqwestDirectTransport {
    client: Client,
}

impl ReqwestDirectTransport {
    pub fn new(timeout_secs: u64) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DirectTransport for ReqwestDirectTransport {
    async fn send(
        &self,
        method: &Method,
        url: &str,
        payload: &Value,
        headers: &HeaderMap,
    ) -> ApiResult<UpstreamResponse> {
        // The upstream expects a JSON document sent as text/plain.
        let response = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| ApiError::TransientNetwork(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = plain_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ApiError::TransientNetwork(e.to_string())));

        Ok(UpstreamResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// 创建请求头
pub fn build_request_headers(arena: &ArenaConfig, auth_token: &str) -> ApiResult<HeaderMap> {
    let origin = arena.base_url.trim_end_matches('/');
    let mut headers = HeaderMap::new();

    insert(&mut headers, "accept", "*/*")?;
    insert(&mut headers, "accept-language", "en-US,en;q=0.9")?;
    insert(&mut headers, "content-type", "text/plain;charset=UTF-8")?;
    insert(&mut headers, "origin", origin)?;
    insert(&mut headers, "referer", &format!("{}/", origin))?;
    insert(&mut headers, "sec-fetch-dest", "empty")?;
    insert(&mut headers, "sec-fetch-mode", "cors")?;
    insert(&mut headers, "sec-fetch-site", "same-origin")?;
    insert(&mut headers, "user-agent", &arena.user_agent)?;
    insert(&mut headers, "cookie", &cookie_header(arena, auth_token))?;

    Ok(headers)
}

fn cookie_header(arena: &ArenaConfig, auth_token: &str) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let named = [
        ("cf_clearance", &arena.cf_clearance),
        ("__cf_bm", &arena.cf_bm),
        ("_cfuvid", &arena.cfuvid),
        ("provisional_user_id", &arena.provisional_user_id),
    ];
    for (name, value) in named {
        if let Some(value) = value {
            pairs.push((name.to_string(), value.clone()));
        }
    }

    let mut extra: Vec<(&String, &String)> = arena
        .browser_cookies
        .iter()
        .filter(|(name, _)| {
            *name != &arena.auth_cookie_name && !pairs.iter().any(|(known, _)| known == *name)
        })
        .collect();
    extra.sort();
    pairs.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));

    pairs.push((arena.auth_cookie_name.clone(), auth_token.to_string()));

    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> ApiResult<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| ApiError::ConfigError(format!("invalid value for header {}: {}", name, e)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Flattens a header map for the browser tier and for classification.
pub fn plain_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
