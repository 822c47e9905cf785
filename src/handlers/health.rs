use crate::handlers::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

/// 根路径处理器
pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "LMArena Free API Server (Rust Version)",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "status": "healthy",
        "api_keys": state.api_key_manager.list_api_keys().len(),
        "models": state.client.catalog().len(),
        "auth_tokens": state.client.auth_token_count()
    }))
}

/// 健康检查
pub async fn ping() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "message": "pong",
            "timestamp": chrono::Utc::now().timestamp(),
            "status": "healthy"
        }))
    )
}
