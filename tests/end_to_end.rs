//! 端到端联调测试
//!
//! 在同一进程里起真实的HTTP服务、调度器和插件代理，
//! 跑通任务从创建到完成的完整链路。

use std::sync::Arc;
use std::time::Duration;

use harvester_api::routes::{create_routes, AppState};
use harvester_core::config::{AppConfig, RetryConfig, WorkerConfig};
use harvester_dispatcher::{AssignmentScheduler, SubmissionEvaluator};
use harvester_domain::{
    entities::{Capability, ExtractionTask, PluginStatus, RedemptionCode, TaskStatus},
    repositories::{PluginRepository, TaskRepository, UsageRepository},
};
use harvester_infrastructure::{
    InMemoryPluginRepository, InMemoryResultRepository, InMemoryTaskRepository,
    InMemoryUsageRepository, PushChannelManager,
};
use harvester_worker::{PluginAgent, SimulatedExecutor};
use serde_json::json;
use tokio::sync::broadcast;

struct TestCluster {
    task_repo: Arc<InMemoryTaskRepository>,
    plugin_repo: Arc<InMemoryPluginRepository>,
    usage_repo: Arc<InMemoryUsageRepository>,
    scheduler: AssignmentScheduler,
    server_url: String,
    shutdown_tx: broadcast::Sender<()>,
}

async fn start_cluster() -> TestCluster {
    let task_repo = Arc::new(InMemoryTaskRepository::new());
    let plugin_repo = Arc::new(InMemoryPluginRepository::new());
    let result_repo = Arc::new(InMemoryResultRepository::new());
    let usage_repo = Arc::new(InMemoryUsageRepository::new());
    let channels = Arc::new(PushChannelManager::new(32));
    let config = Arc::new(AppConfig::default());

    let evaluator = Arc::new(SubmissionEvaluator::new(
        task_repo.clone(),
        plugin_repo.clone(),
        result_repo.clone(),
        usage_repo.clone(),
        config.evaluator.clone(),
    ));
    let scheduler = AssignmentScheduler::new(
        task_repo.clone(),
        plugin_repo.clone(),
        channels.clone(),
        config.dispatcher.clone(),
    );

    let state = AppState {
        task_repo: task_repo.clone(),
        plugin_repo: plugin_repo.clone(),
        result_repo,
        usage_repo: usage_repo.clone(),
        channels,
        evaluator,
        config,
    };
    let router = create_routes(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(4);
    let mut server_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
            .unwrap();
    });

    TestCluster {
        task_repo,
        plugin_repo,
        usage_repo,
        scheduler,
        server_url: format!("http://{addr}"),
        shutdown_tx,
    }
}

fn worker_config(server_url: &str, plugin_id: &str) -> WorkerConfig {
    WorkerConfig {
        enabled: true,
        plugin_id: plugin_id.to_string(),
        version: "1.0.0".to_string(),
        capabilities: vec!["person-search".to_string()],
        server_url: server_url.to_string(),
        heartbeat_interval_seconds: 1,
        heartbeat_failure_threshold: 3,
        progress_report_interval_seconds: 1,
        reconnect: RetryConfig {
            max_attempts: 5,
            base_delay_ms: 50,
            multiplier: 2.0,
            max_delay_ms: 500,
        },
    }
}

/// 轮询直到条件满足或超时
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("等待超时: {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_full_task_lifecycle_with_real_agent() {
    let cluster = start_cluster().await;
    let code = cluster
        .usage_repo
        .create(&RedemptionCode::new("E2E2024".to_string(), 10, 10, 100))
        .await
        .unwrap();

    // 启动插件代理（执行器无延迟）
    let agent = PluginAgent::new(
        worker_config(&cluster.server_url, "e2e-plugin-001"),
        Arc::new(SimulatedExecutor {
            delay_per_record_ms: 0,
            failure_rate: 0.0,
        }),
    )
    .unwrap();
    let agent_shutdown = cluster.shutdown_tx.subscribe();
    let agent_handle = tokio::spawn(async move { agent.run(agent_shutdown).await });

    // 等待代理完成注册并打开推送通道
    wait_until("插件注册", || async {
        cluster
            .plugin_repo
            .find_by_id("e2e-plugin-001")
            .await
            .unwrap()
            .is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 创建任务并跑一轮调度
    let task = cluster
        .task_repo
        .create(&ExtractionTask::new(
            Capability::PersonSearch,
            json!({"keywords": "rust engineer"}),
            5,
            code.id.clone(),
            3,
        ))
        .await
        .unwrap();

    wait_until("任务被分配", || async {
        cluster.scheduler.run_assignment_pass().await.unwrap() > 0
            || cluster
                .task_repo
                .find_by_id(&task.id)
                .await
                .unwrap()
                .unwrap()
                .status
                != TaskStatus::Pending
    })
    .await;

    // 代理执行并提交，任务应走到completed
    wait_until("任务完成", || async {
        cluster
            .task_repo
            .find_by_id(&task.id)
            .await
            .unwrap()
            .unwrap()
            .status
            == TaskStatus::Completed
    })
    .await;

    let done = cluster.task_repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert!(done.usage_charged);
    assert_eq!(done.processed_count, 5);

    // 配额恰好扣减一次
    let charged = cluster
        .usage_repo
        .find_by_code("E2E2024")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(charged.used_count, 1);

    // 插件释放回online并计入生涯统计
    wait_until("插件释放", || async {
        let plugin = cluster
            .plugin_repo
            .find_by_id("e2e-plugin-001")
            .await
            .unwrap()
            .unwrap();
        plugin.status == PluginStatus::Online && plugin.total_tasks == 1
    })
    .await;

    let _ = cluster.shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), agent_handle).await;
}

#[tokio::test]
async fn test_agent_heartbeats_keep_plugin_online() {
    let cluster = start_cluster().await;

    let agent = PluginAgent::new(
        worker_config(&cluster.server_url, "e2e-plugin-002"),
        Arc::new(SimulatedExecutor {
            delay_per_record_ms: 0,
            failure_rate: 0.0,
        }),
    )
    .unwrap();
    let agent_shutdown = cluster.shutdown_tx.subscribe();
    let agent_handle = tokio::spawn(async move { agent.run(agent_shutdown).await });

    wait_until("插件注册", || async {
        cluster
            .plugin_repo
            .find_by_id("e2e-plugin-002")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // 心跳持续可达时插件保持online
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let plugin = cluster
        .plugin_repo
        .find_by_id("e2e-plugin-002")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plugin.status, PluginStatus::Online);

    let _ = cluster.shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), agent_handle).await;
}
