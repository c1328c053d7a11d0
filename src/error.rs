use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// 限流与缓存子系统的错误分类
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// 持久存储不可达或超时
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),
    /// 调用方标识为空或格式错误
    #[error("invalid caller identifier: {0}")]
    InvalidIdentifier(String),
    /// 配置项非法（启动时即失败）
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// 缓存值无法序列化或反序列化
    #[error("cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for ThrottleError {
    fn from(err: redis::RedisError) -> Self {
        ThrottleError::StoreUnavailable(err.to_string())
    }
}

pub type ThrottleResult<T> = Result<T, ThrottleError>;

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    error_message: String,
}

impl IntoResponse for ThrottleError {
    fn into_response(self) -> Response {
        let status = match self {
            ThrottleError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            ThrottleError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ThrottleError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ThrottleError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let error_message = match &self {
            ThrottleError::InvalidIdentifier(_) => "无法识别请求来源".to_string(),
            ThrottleError::StoreUnavailable(_) => "存储服务暂不可用".to_string(),
            ThrottleError::Configuration(_) => "内部服务器错误".to_string(),
            ThrottleError::Serialization(e) => format!("数据格式错误: {}", e),
        };

        let body = Json(ErrorResponse {
            code: status.as_u16() as i32,
            error_message,
        });

        (status, body).into_response()
    }
}
