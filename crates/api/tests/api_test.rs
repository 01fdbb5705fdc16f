use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use harvester_api::routes::{create_routes, AppState};
use harvester_core::config::AppConfig;
use harvester_dispatcher::SubmissionEvaluator;
use harvester_domain::{
    entities::{Capability, Plugin, RedemptionCode, TaskStatus},
    repositories::{PluginRepository, TaskRepository, UsageRepository},
};
use harvester_infrastructure::{
    InMemoryPluginRepository, InMemoryResultRepository, InMemoryTaskRepository,
    InMemoryUsageRepository, PushChannelManager,
};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    task_repo: Arc<InMemoryTaskRepository>,
    plugin_repo: Arc<InMemoryPluginRepository>,
    usage_repo: Arc<InMemoryUsageRepository>,
}

fn test_app() -> TestApp {
    let task_repo = Arc::new(InMemoryTaskRepository::new());
    let plugin_repo = Arc::new(InMemoryPluginRepository::new());
    let result_repo = Arc::new(InMemoryResultRepository::new());
    let usage_repo = Arc::new(InMemoryUsageRepository::new());
    let channels = Arc::new(PushChannelManager::new(8));
    let config = Arc::new(AppConfig::default());
    let evaluator = Arc::new(SubmissionEvaluator::new(
        task_repo.clone(),
        plugin_repo.clone(),
        result_repo.clone(),
        usage_repo.clone(),
        config.evaluator.clone(),
    ));

    let state = AppState {
        task_repo: task_repo.clone(),
        plugin_repo: plugin_repo.clone(),
        result_repo,
        usage_repo: usage_repo.clone(),
        channels,
        evaluator,
        config,
    };
    TestApp {
        router: create_routes(state),
        task_repo,
        plugin_repo,
        usage_repo,
    }
}

async fn send_json(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn seed_code(app: &TestApp) -> RedemptionCode {
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 1000);
    app.usage_repo.create(&code).await.unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app();
    let (status, body) = send_json(&app.router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["connected_plugins"], 0);
}

#[tokio::test]
async fn test_plugin_registration_is_idempotent() {
    let app = test_app();
    let payload = json!({
        "plugin_id": "linkedin-ext-001",
        "version": "1.0.0",
        "capabilities": ["person-search"]
    });

    let (status, body) =
        send_json(&app.router, Method::POST, "/api/plugins/register", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_update"], false);

    let (status, body) =
        send_json(&app.router, Method::POST, "/api/plugins/register", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_update"], true);
}

#[tokio::test]
async fn test_plugin_registration_validation() {
    let app = test_app();

    // ID太短
    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/register",
        Some(json!({"plugin_id": "ab", "version": "1.0.0", "capabilities": ["person-search"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    // 未知能力标签
    let (status, _) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/register",
        Some(json!({"plugin_id": "plugin-001", "version": "1.0.0", "capabilities": ["dom-render"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_heartbeat_unknown_plugin() {
    let app = test_app();
    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/heartbeat",
        Some(json!({"plugin_id": "ghost-plugin", "status": "online"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "PLUGIN_NOT_FOUND");
}

#[tokio::test]
async fn test_stream_rejects_unregistered_plugin() {
    let app = test_app();
    let (status, _) = send_json(
        &app.router,
        Method::GET,
        "/api/plugins/tasks/stream?plugin_id=ghost-plugin",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_task_and_query_status() {
    let app = test_app();
    seed_code(&app).await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "VIP2024",
            "task_type": "person-search",
            "search_params": {"keywords": "rust"},
            "max_results": 50
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let (status, body) = send_json(
        &app.router,
        Method::GET,
        &format!("/api/tasks/{task_id}/status"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["progress"], 0);
    assert_eq!(body["data"]["max_results"], 50);
}

#[tokio::test]
async fn test_results_page_beyond_range_is_empty() {
    let app = test_app();
    seed_code(&app).await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "VIP2024",
            "task_type": "person-search",
            "search_params": {},
            "max_results": 50
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    // 偏移量计算即使溢出i64也按超出末页处理
    let (status, body) = send_json(
        &app.router,
        Method::GET,
        &format!("/api/tasks/{task_id}/results?page=9223372036854775807&page_size=100"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_heartbeat_with_mismatched_task_is_accepted() {
    let app = test_app();
    let plugin = Plugin::new(
        "linkedin-ext-001".to_string(),
        "1.0.0".to_string(),
        vec![Capability::PersonSearch],
    );
    app.plugin_repo.upsert(&plugin).await.unwrap();

    // 在手任务与队列分配不符时心跳仍被接受，只记录告警
    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/heartbeat",
        Some(json!({
            "plugin_id": "linkedin-ext-001",
            "status": "busy",
            "current_task_id": "no-such-task"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_create_task_clamps_max_results() {
    let app = test_app();
    seed_code(&app).await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "VIP2024",
            "task_type": "company-search",
            "search_params": {},
            "max_results": 5000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // 结果数上限被钳制到硬顶
    assert_eq!(body["data"]["max_results"], 1000);
}

#[tokio::test]
async fn test_create_task_with_unknown_code() {
    let app = test_app();
    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "NOPE",
            "task_type": "person-search",
            "search_params": {},
            "max_results": 10
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "CODE_NOT_FOUND");
}

#[tokio::test]
async fn test_create_task_quota_exhausted() {
    let app = test_app();
    let mut code = RedemptionCode::new("EMPTY".to_string(), 1, 10, 1000);
    code.used_count = 1;
    app.usage_repo.create(&code).await.unwrap();

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "EMPTY",
            "task_type": "person-search",
            "search_params": {},
            "max_results": 10
        })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "QUOTA_EXHAUSTED");
}

#[tokio::test]
async fn test_cancel_task_conflicts_when_terminal() {
    let app = test_app();
    seed_code(&app).await;
    let (_, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "VIP2024",
            "task_type": "person-search",
            "search_params": {},
            "max_results": 10
        })),
    )
    .await;
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    let (status, _) = send_json(
        &app.router,
        Method::POST,
        &format!("/api/tasks/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        &format!("/api/tasks/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_progress_and_submit_flow() {
    let app = test_app();
    seed_code(&app).await;
    app.plugin_repo
        .upsert(&Plugin::new(
            "plugin-a".to_string(),
            "1.0.0".to_string(),
            vec![Capability::PersonSearch],
        ))
        .await
        .unwrap();

    let (_, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "VIP2024",
            "task_type": "person-search",
            "search_params": {"keywords": "rust"},
            "max_results": 2
        })),
    )
    .await;
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();

    // 调度器完成认领后插件开始上报
    app.task_repo
        .claim_pending(&task_id, "plugin-a", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    let (status, _) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/progress",
        Some(json!({"task_id": task_id, "plugin_id": "plugin-a", "processed_count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send_json(
        &app.router,
        Method::GET,
        &format!("/api/tasks/{task_id}/status"),
        None,
    )
    .await;
    assert_eq!(body["data"]["status"], "processing");
    assert_eq!(body["data"]["progress"], 50);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/submit",
        Some(json!({
            "task_id": task_id,
            "plugin_id": "plugin-a",
            "status": "completed",
            "records": [
                {"name": "张三", "linkedin_url": "https://linkedin.com/in/zhangsan", "company": "Acme"},
                {"name": "李四", "linkedin_url": "https://linkedin.com/in/lisi"}
            ],
            "processed_count": 2,
            "total_count": 2
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], true);

    // 任务完成，配额扣减一次
    let task = app.task_repo.find_by_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let code = app.usage_repo.find_by_code("VIP2024").await.unwrap().unwrap();
    assert_eq!(code.used_count, 1);

    // 结果分页查询
    let (status, body) = send_json(
        &app.router,
        Method::GET,
        &format!("/api/tasks/{task_id}/results?page=1&page_size=1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
    assert!(body["data"]["quality_score"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_progress_from_non_owner_is_forbidden() {
    let app = test_app();
    seed_code(&app).await;
    let (_, body) = send_json(
        &app.router,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "redemption_code": "VIP2024",
            "task_type": "person-search",
            "search_params": {},
            "max_results": 10
        })),
    )
    .await;
    let task_id = body["data"]["task_id"].as_str().unwrap().to_string();
    app.task_repo
        .claim_pending(&task_id, "plugin-a", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/plugins/progress",
        Some(json!({"task_id": task_id, "plugin_id": "plugin-b", "processed_count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "NOT_OWNER");
}

#[tokio::test]
async fn test_validate_code_endpoint() {
    let app = test_app();
    seed_code(&app).await;

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/redemption-codes/validate",
        Some(json!({"code": "VIP2024"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["remaining_uses"], 10);
    assert_eq!(body["data"]["single_limit"], 1000);
}
