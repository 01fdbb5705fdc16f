use axum::{extract::State, Json};
use chrono::Utc;
use harvester_domain::entities::CodeValidation;
use serde::Deserialize;

use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct ValidateCodeRequest {
    pub code: String,
    /// 计划的单次请求结果数，省略时只做基础校验
    #[serde(default = "default_requested")]
    pub requested_results: i64,
}

fn default_requested() -> i64 {
    1
}

pub async fn validate_code(
    State(state): State<AppState>,
    Json(req): Json<ValidateCodeRequest>,
) -> ApiResult<ApiResponse<CodeValidation>> {
    let validation = state
        .usage_repo
        .validate(&req.code, Utc::now(), req.requested_results)
        .await?;
    Ok(ApiResponse::success(validation))
}
