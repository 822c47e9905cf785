use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{ChatCompletionRequest, ChatCompletionResponse};
use crate::services::api_key_manager::AdmittedKey;
use crate::services::auth_pool::{AuthTokenPool, JsonFileTokenStore, TokenStore};
use crate::services::browser_fetch::{BrowserFetchProvider, DisabledBrowserFetch, SidecarBrowserFetch};
use crate::services::captcha_broker::{CaptchaMinter, CaptchaTokenBroker, SidecarCaptchaMinter, SidecarMintMode};
use crate::services::completion_builder::CompletionBuilder;
use crate::services::direct_client::ReqwestDirectTransport;
use crate::services::dispatcher::{RequestDispatcher, UpstreamRequest};
use crate::services::message_processor::MessageProcessor;
use crate::services::model_catalog::ModelCatalog;
use crate::services::session_store::SessionStore;
use futures_util::Stream;
use reqwest::{Client, Method};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type SseDataStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// LMArena客户端
///
/// Resolves the model, prepares the evaluation turn, runs it through the
/// dispatcher and shapes the result for OpenAI clients.
pub struct ArenaClient {
    dispatcher: Arc<RequestDispatcher>,
    catalog: Arc<ModelCatalog>,
    sessions: Arc<SessionStore>,
    base_url: String,
}

impl ArenaClient {
    pub fn new(config: &Config) -> ApiResult<Self> {
        let arena = &config.arena;

        // The config file doubles as the pool's backing store.
        let store: Arc<dyn TokenStore> = Arc::new(JsonFileTokenStore::new(&config.config_file));
        let pool = AuthTokenPool::new(
            arena.auth_tokens.clone(),
            store,
            arena.auth_cookie_name.clone(),
            arena.browser_cookies.clone(),
        );
        if pool.is_empty() {
            match pool.fallback_from_cookie(&arena.browser_cookies) {
                Ok(_) => info!("Seeded auth token pool from the browser cookie"),
                Err(e) => warn!("Auth token pool is empty: {}", e),
            }
        }
        info!("Auth token pool loaded with {} token(s)", pool.len());

        let sidecar_client = Client::builder()
            .timeout(Duration::from_secs(arena.request_timeout_secs))
            .build()?;

        let mut minters: Vec<Arc<dyn CaptchaMinter>> = Vec::new();
        let browser: Arc<dyn BrowserFetchProvider> = match &arena.browser_sidecar_url {
            Some(url) => {
                info!("Browser sidecar at {}", url);
                for mode in [SidecarMintMode::Page, SidecarMintMode::Context] {
                    minters.push(Arc::new(SidecarCaptchaMinter::new(sidecar_client.clone(), url.clone(), mode)));
                }
                Arc::new(SidecarBrowserFetch::new(sidecar_client, url.clone(), arena.browser_max_sessions))
            }
            None => {
                info!("No browser sidecar configured, browser tier disabled");
                Arc::new(DisabledBrowserFetch)
            }
        };

        let captcha = Arc::new(CaptchaTokenBroker::new(minters, arena, &config.retry));
        let direct = Arc::new(ReqwestDirectTransport::new(arena.request_timeout_secs)?);
        let dispatcher = RequestDispatcher::new(
            Arc::new(pool),
            captcha,
            direct,
            browser,
            arena.clone(),
            config.retry.clone(),
        );

        Ok(Self::with_parts(
            Arc::new(dispatcher),
            Arc::new(ModelCatalog::new(config.models.clone())),
            Arc::new(SessionStore::new(arena.session_timeout_secs)),
            arena.base_url.clone(),
        ))
    }

    pub fn with_parts(
        dispatcher: Arc<RequestDispatcher>,
        catalog: Arc<ModelCatalog>,
        sessions: Arc<SessionStore>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            sessions,
            base_url: base_url.into(),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn auth_token_count(&self) -> usize {
        self.dispatcher.auth_pool().len()
    }

    /// 创建聊天完成
    pub async fn create_completion(
        &self,
        key: &AdmittedKey,
        request: &ChatCompletionRequest,
    ) -> ApiResult<ChatCompletionResponse> {
        let (builder, prompt, dispatched) = self.start(key, request).await?;
        builder.aggregate(dispatched, &prompt).await
    }

    /// 创建流式聊天完成
    pub async fn create_completion_stream(
        &self,
        key: &AdmittedKey,
        request: &ChatCompletionRequest,
    ) -> ApiResult<SseDataStream> {
        let (builder, _prompt, dispatched) = self.start(key, request).await?;
        Ok(Box::pin(builder.into_sse_data(dispatched)))
    }

    async fn start(
        &self,
        key: &AdmittedKey,
        request: &ChatCompletionRequest,
    ) -> ApiResult<(CompletionBuilder, String, crate::services::stream_translator::EventStream)> {
        let model_name = request
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("model is required".to_string()))?;
        let model = self.catalog.resolve(model_name)?;

        let session = request
            .session_id
            .as_deref()
            .and_then(|id| self.sessions.lookup(&key.key, id));
        let prompt = MessageProcessor::prepare_prompt(&request.messages, session.is_some())?;
        let prepared = MessageProcessor::build_evaluation(&self.base_url, &model.id, &prompt, session.as_ref());

        info!(
            "Chat request for {} ({}), {} turn",
            model.public_name,
            key.name,
            if session.is_some() { "follow-up" } else { "first" }
        );

        let dispatched = self
            .dispatcher
            .dispatch(&UpstreamRequest {
                model: model.public_name.clone(),
                method: Method::POST,
                url: prepared.url,
                payload: prepared.payload,
                client_recaptcha_token: request.recaptcha_token.clone(),
            })
            .await?;
        debug!(
            "Dispatched {} via {} tier after {} attempt(s)",
            model.public_name,
            dispatched.tier,
            dispatched.attempts.len()
        );

        if let Some(session_id) = &request.session_id {
            self.sessions.commit(&key.key, session_id, prepared.turn);
        }

        let builder = CompletionBuilder::new(model.public_name.clone(), request.session_id.clone());
        Ok((builder, prompt, dispatched.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArenaConfig, ModelEntry, RetryConfig};
    use crate::models::{ChatMessage, ChatMessageContent};
    use crate::services::auth_pool::MemoryTokenStore;
    use crate::services::captcha_broker::SiteKeyAction;
    use crate::services::direct_client::{DirectTransport, UpstreamResponse};
    use crate::models::Tier;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;
    use serde_json::Value;
    use std::collections::HashMap;

    struct EchoDirect {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DirectTransport for EchoDirect {
        async fn send(&self, _m: &Method, url: &str, _p: &Value, _h: &HeaderMap) -> ApiResult<UpstreamResponse> {
            self.urls.lock().push(url.to_string());
            let body = futures_util::stream::once(async {
                Ok::<_, ApiError>(Bytes::from_static(b"a0:\"Hi\"\nad:{\"finishReason\":\"stop\"}\n"))
            });
            Ok(UpstreamResponse {
                status: 200,
                headers: HashMap::new(),
                body: Box::pin(body),
            })
        }
    }

    struct StaticMinter;

    #[async_trait]
    impl CaptchaMinter for StaticMinter {
        fn name(&self) -> &str {
            "static"
        }

        fn tier(&self) -> Tier {
            Tier::Direct
        }

        async fn mint(&self, _key: &SiteKeyAction) -> ApiResult<String> {
            Ok("captcha".to_string())
        }
    }

    fn client() -> (ArenaClient, Arc<EchoDirect>) {
        let arena = ArenaConfig::default();
        let retry = RetryConfig::default();
        let direct = Arc::new(EchoDirect { urls: Mutex::new(Vec::new()) });
        let pool = AuthTokenPool::new(
            vec!["auth-1".to_string()],
            Arc::new(MemoryTokenStore::default()),
            arena.auth_cookie_name.clone(),
            HashMap::new(),
        );
        let captcha = CaptchaTokenBroker::new(vec![Arc::new(StaticMinter)], &arena, &retry);
        let dispatcher = RequestDispatcher::new(
            Arc::new(pool),
            Arc::new(captcha),
            direct.clone(),
            Arc::new(DisabledBrowserFetch),
            arena.clone(),
            retry,
        );
        let catalog = ModelCatalog::new(vec![ModelEntry {
            public_name: "gpt-4o".to_string(),
            id: "upstream-gpt".to_string(),
            organization: None,
            capabilities: Value::Null,
        }]);
        (
            ArenaClient::with_parts(Arc::new(dispatcher), Arc::new(catalog), Arc::new(SessionStore::new(3600)), arena.base_url),
            direct,
        )
    }

    fn request(model: &str, session: Option<&str>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some(model.to_string()),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: ChatMessageContent::Text("Hello".to_string()),
            }],
            session_id: session.map(str::to_string),
            ..Default::default()
        }
    }

    fn key() -> AdmittedKey {
        AdmittedKey {
            name: "Test Key".to_string(),
            key: "test-key".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected_before_dispatch() {
        let (client, direct) = client();
        let err = client.create_completion(&key(), &request("nope", None)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(direct.urls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_session_continues_evaluation() {
        let (client, direct) = client();

        let first = client.create_completion(&key(), &request("gpt-4o", Some("conv-1"))).await.unwrap();
        assert_eq!(first.choices[0].message.content, "Hi");
        assert_eq!(first.session_id.as_deref(), Some("conv-1"));

        client.create_completion(&key(), &request("gpt-4o", Some("conv-1"))).await.unwrap();

        let urls = direct.urls.lock().clone();
        assert!(urls[0].ends_with("/create-evaluation"));
        assert!(urls[1].contains("/post-to-evaluation/"));
        assert_eq!(client.sessions().lookup("test-key", "conv-1").unwrap().turns, 2);
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let (client, _direct) = client();
        let data: Vec<String> = client
            .create_completion_stream(&key(), &request("GPT-4o", None))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(data.last().map(String::as_str), Some("[DONE]"));
        assert!(data[1].contains("\"content\":\"Hi\""));
    }
}
