pub mod api_keys;
pub mod chat;
pub mod health;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::services::api_key_manager::AdmittedKey;
use crate::services::{ApiKeyManager, ArenaClient};
use axum::{
    routing::{get, post},
    Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<ArenaClient>,
    pub config: Config,
    pub api_key_manager: Arc<ApiKeyManager>,
}

pub type BearerHeader = Option<TypedHeader<Authorization<Bearer>>>;

impl AppState {
    pub fn new(config: Config) -> ApiResult<Self> {
        let client = Arc::new(ArenaClient::new(&config)?);
        let api_key_manager = Arc::new(ApiKeyManager::new(config.api_keys.clone()));
        Ok(Self {
            client,
            config,
            api_key_manager,
        })
    }

    /// 校验Bearer密钥并计入用量
    pub fn admit(&self, bearer: &BearerHeader) -> ApiResult<AdmittedKey> {
        let token = bearer_token(bearer)?;
        self.api_key_manager.admit(token)
    }
}

pub fn bearer_token(bearer: &BearerHeader) -> ApiResult<&str> {
    bearer
        .as_ref()
        .map(|TypedHeader(auth)| auth.token())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer API key".to_string()))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        // 健康检查
        .route("/", get(health::root))
        .route("/ping", get(health::ping))

        // 聊天API - OpenAI兼容
        .route("/v1/chat/completions", post(chat::completions))
        .route("/api/v1/chat/completions", post(chat::completions))

        // 模型列表 - OpenAI兼容
        .route("/v1/models", get(chat::models))
        .route("/api/v1/models", get(chat::models))

        // API密钥信息
        .route("/api_keys/info", get(api_keys::get_api_key_info))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
        )
        .with_state(state)
}
