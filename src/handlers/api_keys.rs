use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::{
    error::ApiResult,
    handlers::{bearer_token, AppState, BearerHeader},
    services::{api_key_manager::ApiKeyInfo, session_store::SessionStoreStats},
};

#[derive(Debug, Serialize)]
pub struct KeyInfoResponse {
    pub key: ApiKeyInfo,
    pub sessions: SessionStoreStats,
}

/// 获取API密钥信息
pub async fn get_api_key_info(
    State(state): State<AppState>,
    bearer: BearerHeader,
) -> ApiResult<Json<KeyInfoResponse>> {
    let api_key = bearer_token(&bearer)?;
    let key = state.api_key_manager.get_api_key_info(api_key)?;
    let sessions = state.client.sessions().stats(api_key);

    Ok(Json(KeyInfoResponse { key, sessions }))
}
