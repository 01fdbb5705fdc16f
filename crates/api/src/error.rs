use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use harvester_core::HarvesterError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Harvester(#[from] HarvesterError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Harvester(e) => match e {
                HarvesterError::TaskNotFound { id } => (
                    StatusCode::NOT_FOUND,
                    "TASK_NOT_FOUND",
                    format!("任务 {id} 不存在"),
                ),
                HarvesterError::PluginNotFound { id } => (
                    StatusCode::NOT_FOUND,
                    "PLUGIN_NOT_FOUND",
                    format!("插件 {id} 未注册"),
                ),
                HarvesterError::CodeNotFound { .. } => (
                    StatusCode::NOT_FOUND,
                    "CODE_NOT_FOUND",
                    "兑换码不存在".to_string(),
                ),
                HarvesterError::InvalidPluginId(_)
                | HarvesterError::InvalidCapability(_)
                | HarvesterError::Validation(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
                }
                HarvesterError::InvalidBatch(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_BATCH", e.to_string())
                }
                HarvesterError::NotOwner { .. } => {
                    (StatusCode::FORBIDDEN, "NOT_OWNER", e.to_string())
                }
                HarvesterError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", e.to_string()),
                HarvesterError::QuotaExhausted(_) => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "QUOTA_EXHAUSTED",
                    e.to_string(),
                ),
                HarvesterError::NoActiveChannel { id } => (
                    StatusCode::CONFLICT,
                    "NO_ACTIVE_CHANNEL",
                    format!("插件 {id} 没有打开的推送通道"),
                ),
                // 存储层错误不向调用方暴露细节
                _ => {
                    error!("内部错误: {e}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "内部服务器错误".to_string(),
                    )
                }
            },
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            },
            "timestamp": chrono::Utc::now(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
