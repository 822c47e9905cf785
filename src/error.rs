use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;
pub type AppResult<T> = Result<T, AppError>;

pub use ApiError as AppError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No upstream auth token available: {0}")]
    AuthExhausted(String),

    #[error("Captcha token could not be minted: {0}")]
    CaptchaMint(String),

    #[error("Upstream anti-bot protection rejected the request ({status}): {detail}")]
    AntiBotRejected { status: u16, detail: String },

    #[error("Upstream rate limited the request: {detail}")]
    RateLimited {
        retry_after: Option<Duration>,
        detail: String,
    },

    #[error("Upstream unreachable: {0}")]
    TransientNetwork(String),

    #[error("Malformed upstream response ({status}): {body}")]
    MalformedUpstream { status: u16, body: String },

    #[error("Upstream rejected the request ({status}): {body}")]
    NonRetryable { status: u16, body: String },

    #[error("Browser fetch failed: {0}")]
    BrowserFetch(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

impl ApiError {
    /// Stable identifier exposed to callers so upstream failure kinds stay distinguishable.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::HttpRequest(_) | ApiError::TransientNetwork(_) => "upstream_unavailable",
            ApiError::JsonError(_) | ApiError::InvalidRequest(_) => "invalid_request_error",
            ApiError::IoError(_) | ApiError::ConfigError(_) | ApiError::Internal(_) => "api_error",
            ApiError::AuthExhausted(_) => "auth_exhausted",
            ApiError::CaptchaMint(_) => "captcha_mint_failed",
            ApiError::AntiBotRejected { .. } => "upstream_anti_bot",
            ApiError::RateLimited { .. } => "upstream_rate_limited",
            ApiError::MalformedUpstream { .. } => "upstream_malformed",
            ApiError::NonRetryable { .. } => "upstream_rejected",
            ApiError::BrowserFetch(_) => "browser_fetch_failed",
            ApiError::Unauthorized(_) => "authentication_error",
            ApiError::NotFound(_) => "not_found_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::HttpRequest(_) => StatusCode::BAD_GATEWAY,
            ApiError::JsonError(_) => StatusCode::BAD_REQUEST,
            ApiError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::AuthExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::CaptchaMint(_) => StatusCode::BAD_GATEWAY,
            ApiError::AntiBotRejected { .. } => StatusCode::BAD_GATEWAY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::MalformedUpstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::NonRetryable { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::BrowserFetch(_) => StatusCode::BAD_GATEWAY,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16()
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(wait) = retry_after {
            // Round up so clients never retry before the upstream hint elapses.
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinguishable() {
        let anti_bot = ApiError::AntiBotRejected {
            status: 403,
            detail: "blocked".to_string(),
        };
        let limited = ApiError::RateLimited {
            retry_after: None,
            detail: "slow down".to_string(),
        };
        let down = ApiError::TransientNetwork("connection reset".to_string());

        assert_ne!(anti_bot.kind(), limited.kind());
        assert_ne!(limited.kind(), down.kind());
        assert_ne!(anti_bot.kind(), down.kind());
    }

    #[test]
    fn test_non_retryable_keeps_upstream_status() {
        let err = ApiError::NonRetryable {
            status: 404,
            body: "unknown model".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.to_string().contains("unknown model"));
    }

    #[test]
    fn test_rate_limited_sets_retry_after_header() {
        let err = ApiError::RateLimited {
            retry_after: Some(Duration::from_millis(6500)),
            detail: "Too Many Requests".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "7"
        );
    }
}
