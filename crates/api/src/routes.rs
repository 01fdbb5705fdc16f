use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use harvester_core::config::AppConfig;
use harvester_dispatcher::SubmissionEvaluator;
use harvester_domain::repositories::{
    PluginRepository, ResultRepository, TaskRepository, UsageRepository,
};
use harvester_infrastructure::PushChannelManager;
use tower_http::cors::CorsLayer;

use crate::handlers::{
    codes::validate_code,
    health::health_check,
    plugins::{heartbeat_plugin, register_plugin, report_progress, stream_tasks, submit_results},
    tasks::{cancel_task, create_task, get_task_results, get_task_status},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub task_repo: Arc<dyn TaskRepository>,
    pub plugin_repo: Arc<dyn PluginRepository>,
    pub result_repo: Arc<dyn ResultRepository>,
    pub usage_repo: Arc<dyn UsageRepository>,
    pub channels: Arc<PushChannelManager>,
    pub evaluator: Arc<SubmissionEvaluator>,
    pub config: Arc<AppConfig>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    let cors_enabled = state.config.api.cors_enabled;
    let router = Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 插件侧API
        .route("/api/plugins/register", post(register_plugin))
        .route("/api/plugins/heartbeat", post(heartbeat_plugin))
        .route("/api/plugins/tasks/stream", get(stream_tasks))
        .route("/api/plugins/submit", post(submit_results))
        .route("/api/plugins/progress", post(report_progress))
        // 调用方API
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}/status", get(get_task_status))
        .route("/api/tasks/{id}/results", get(get_task_results))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/redemption-codes/validate", post(validate_code))
        .with_state(state);

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
