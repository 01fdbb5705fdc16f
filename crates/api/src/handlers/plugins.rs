use std::convert::Infallible;
use std::str::FromStr;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use futures::StreamExt;
use harvester_core::HarvesterError;
use harvester_dispatcher::{Submission, SubmissionOutcome};
use harvester_domain::entities::{Capability, Plugin, PluginStatus};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub plugin_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub plugin_id: String,
    pub is_update: bool,
}

pub async fn register_plugin(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<ApiResponse<RegisterResponse>> {
    Plugin::validate_id(&req.plugin_id).map_err(ApiError::Harvester)?;
    if req.capabilities.is_empty() {
        return Err(ApiError::BadRequest("capabilities 不能为空".to_string()));
    }
    let capabilities = req
        .capabilities
        .iter()
        .map(|s| Capability::from_str(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ApiError::Harvester)?;

    let plugin = Plugin::new(req.plugin_id.clone(), req.version, capabilities);
    let is_new = state.plugin_repo.upsert(&plugin).await?;
    info!(
        "插件 {} {}",
        req.plugin_id,
        if is_new { "完成注册" } else { "刷新注册信息" }
    );

    Ok(ApiResponse::success(RegisterResponse {
        plugin_id: req.plugin_id,
        is_update: !is_new,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub plugin_id: String,
    pub status: String,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

pub async fn heartbeat_plugin(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<ApiResponse<()>> {
    let status = PluginStatus::from_str(&req.status).map_err(ApiError::Harvester)?;
    let known = state
        .plugin_repo
        .heartbeat(&req.plugin_id, status, chrono::Utc::now())
        .await?;
    if !known {
        return Err(ApiError::Harvester(HarvesterError::PluginNotFound {
            id: req.plugin_id,
        }));
    }

    // 上报的在手任务与队列中的归属核对，不一致只记录不拒绝
    if let Some(task_id) = &req.current_task_id {
        let owns = match state.task_repo.find_by_id(task_id).await? {
            Some(task) => task.assigned_plugin_id.as_deref() == Some(req.plugin_id.as_str()),
            None => false,
        };
        if !owns {
            warn!(
                "插件 {} 心跳上报的任务 {} 与当前分配不符",
                req.plugin_id, task_id
            );
        }
    }
    Ok(ApiResponse::success(()))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub plugin_id: String,
}

/// 打开SSE推送通道。连接建立后立即收到connection-ack，
/// 之后是周期性keepalive和任务分配通知。
pub async fn stream_tasks(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // 未注册的插件不允许建立通道
    if state.plugin_repo.find_by_id(&query.plugin_id).await?.is_none() {
        return Err(ApiError::Harvester(HarvesterError::PluginNotFound {
            id: query.plugin_id,
        }));
    }

    let rx = state
        .channels
        .open(&query.plugin_id, env!("CARGO_PKG_VERSION"))
        .await;
    info!("插件 {} 打开了推送通道", query.plugin_id);

    let stream = ReceiverStream::new(rx).map(|message| {
        let event = match Event::default().json_data(&message) {
            Ok(event) => event,
            // 推送消息都是可序列化的固定结构，这里不可达
            Err(_) => Event::default().data("{}"),
        };
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn submit_results(
    State(state): State<AppState>,
    Json(submission): Json<Submission>,
) -> ApiResult<ApiResponse<SubmissionOutcome>> {
    let outcome = state.evaluator.handle_submission(submission).await?;
    Ok(ApiResponse::success(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub task_id: String,
    pub plugin_id: String,
    pub processed_count: i64,
}

/// 进度上报。首次上报完成assigned→processing迁移。
pub async fn report_progress(
    State(state): State<AppState>,
    Json(req): Json<ProgressRequest>,
) -> ApiResult<ApiResponse<()>> {
    let updated = state
        .task_repo
        .record_progress(&req.task_id, &req.plugin_id, req.processed_count)
        .await?;
    if !updated {
        let task = state.task_repo.find_by_id(&req.task_id).await?;
        return Err(match task {
            None => ApiError::Harvester(HarvesterError::TaskNotFound { id: req.task_id }),
            Some(_) => ApiError::Harvester(HarvesterError::NotOwner {
                task_id: req.task_id,
                plugin_id: req.plugin_id,
            }),
        });
    }
    Ok(ApiResponse::success(()))
}
