use crate::error::{ApiError, ApiResult};
use crate::handlers::{AppState, BearerHeader};
use crate::models::ChatCompletionRequest;
use crate::services::model_catalog::ModelList;
use crate::utils::unix_timestamp;
use axum::{
    extract::State,
    response::{sse::Event, IntoResponse, Json, Response, Sse},
};
use futures_util::StreamExt;
use std::convert::Infallible;
use tracing::debug;

/// 聊天补全处理器
pub async fn completions(
    State(state): State<AppState>,
    bearer: BearerHeader,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    let key = state.admit(&bearer)?;

    // 验证请求
    if request.messages.is_empty() {
        return Err(ApiError::InvalidRequest("Messages cannot be empty".to_string()));
    }

    if request.stream.unwrap_or(false) {
        // 流式响应
        let stream = state.client.create_completion_stream(&key, &request).await?;
        let events = stream.map(|data| Ok::<_, Infallible>(Event::default().data(data)));
        Ok(Sse::new(events).into_response())
    } else {
        // 非流式响应
        let response = state.client.create_completion(&key, &request).await?;
        debug!("Completion {} finished for {}", response.id, key.name);
        Ok(Json(response).into_response())
    }
}

/// 获取模型列表
pub async fn models(State(state): State<AppState>) -> Json<ModelList> {
    Json(state.client.catalog().list(unix_timestamp()))
}
