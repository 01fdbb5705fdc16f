use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use harvester_domain::entities::{Capability, ExtractionTask, PluginStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::response::{ApiResponse, PaginatedResponse};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub redemption_code: String,
    pub task_type: String,
    pub search_params: serde_json::Value,
    pub max_results: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub max_results: i64,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<ApiResponse<CreateTaskResponse>> {
    let task_type = Capability::from_str(&req.task_type).map_err(ApiError::Harvester)?;
    if req.max_results <= 0 {
        return Err(ApiError::BadRequest("max_results 必须大于0".to_string()));
    }
    let max_results = req.max_results.min(state.config.evaluator.max_results_cap);

    // 创建时只校验配额，扣减发生在任务完成时
    let validation = state
        .usage_repo
        .validate(&req.redemption_code, Utc::now(), max_results)
        .await?;

    let task = ExtractionTask::new(
        task_type,
        req.search_params,
        max_results,
        validation.code_id,
        state.config.dispatcher.max_reassign_attempts,
    );
    let task = state.task_repo.create(&task).await?;
    info!("创建任务 {} (类型 {}, 上限 {})", task.id, task_type, max_results);

    Ok(ApiResponse::success(CreateTaskResponse {
        task_id: task.id,
        max_results,
    }))
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    /// 进度百分比（0-100）
    pub progress: i64,
    pub processed_count: i64,
    pub max_results: i64,
    pub assigned_plugin_id: Option<String>,
    pub retry_count: i32,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

pub async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<TaskStatusResponse>> {
    let task = state
        .task_repo
        .find_by_id(&id)
        .await?
        .ok_or(harvester_core::HarvesterError::TaskNotFound { id })?;

    Ok(ApiResponse::success(TaskStatusResponse {
        progress: task.progress(),
        task_id: task.id,
        status: task.status,
        processed_count: task.processed_count,
        max_results: task.max_results,
        assigned_plugin_id: task.assigned_plugin_id,
        retry_count: task.retry_count,
        timeout_at: task.timeout_at,
        created_at: task.created_at,
        completed_at: task.completed_at,
        error_message: task.error_message,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct TaskResultsResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub quality_score: Option<f64>,
    #[serde(flatten)]
    pub records: PaginatedResponse<serde_json::Value>,
}

/// 分页返回任务的胜出批次记录
pub async fn get_task_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<ApiResponse<TaskResultsResponse>> {
    if query.page < 1 || query.page_size < 1 || query.page_size > 100 {
        return Err(ApiError::BadRequest(
            "page 必须大于0，page_size 必须在1-100之间".to_string(),
        ));
    }

    let task = state
        .task_repo
        .find_by_id(&id)
        .await?
        .ok_or(harvester_core::HarvesterError::TaskNotFound { id: id.clone() })?;

    let winning = state.result_repo.find_winning(&id).await?;
    let (all_records, quality_score) = match &winning {
        Some(batch) => (
            batch
                .result_data
                .as_array()
                .cloned()
                .unwrap_or_default(),
            Some(batch.quality_score),
        ),
        None => (vec![], None),
    };

    let total = all_records.len() as i64;
    // page无上界，溢出的偏移量按超出末页处理
    let offset = (query.page - 1)
        .checked_mul(query.page_size)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(usize::MAX);
    let items: Vec<serde_json::Value> = all_records
        .into_iter()
        .skip(offset)
        .take(query.page_size as usize)
        .collect();

    Ok(ApiResponse::success(TaskResultsResponse {
        task_id: task.id,
        status: task.status,
        quality_score,
        records: PaginatedResponse::new(items, total, query.page, query.page_size),
    }))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<()>> {
    let before = state.task_repo.cancel(&id).await?;
    // 取消前已被分配的，释放占用的插件
    if let Some(plugin_id) = &before.assigned_plugin_id {
        state
            .plugin_repo
            .set_status(plugin_id, PluginStatus::Online)
            .await?;
    }
    info!("任务 {id} 已取消");
    Ok(ApiResponse::success_with_message((), "任务已取消".to_string()))
}
