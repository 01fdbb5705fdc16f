use std::sync::Arc;

use anyhow::{Context, Result};
use harvester_api::routes::{create_routes, AppState};
use harvester_core::config::AppConfig;
use harvester_dispatcher::{AssignmentScheduler, PluginLivenessDetector, SubmissionEvaluator};
use harvester_infrastructure::{
    create_sqlite_pool, PushChannelManager, SqlitePluginRepository, SqliteResultRepository,
    SqliteTaskRepository, SqliteUsageRepository,
};
use harvester_worker::{PluginAgent, SimulatedExecutor};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info};

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 仅运行调度器
    Dispatcher,
    /// 仅运行Worker端插件代理
    Worker,
    /// 仅运行API服务器
    Api,
    /// 同进程运行调度器与API
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    state: Option<AppState>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        // Worker模式不需要本地存储
        let state = match mode {
            AppMode::Worker => None,
            _ => Some(Self::build_state(&config).await?),
        };

        Ok(Self {
            config,
            mode,
            state,
        })
    }

    async fn build_state(config: &AppConfig) -> Result<AppState> {
        let pool = create_sqlite_pool(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .context("初始化数据库失败")?;

        let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let plugin_repo = Arc::new(SqlitePluginRepository::new(pool.clone()));
        let result_repo = Arc::new(SqliteResultRepository::new(pool.clone()));
        let usage_repo = Arc::new(SqliteUsageRepository::new(pool));
        let channels = Arc::new(PushChannelManager::new(config.channel.buffer_size));
        let evaluator = Arc::new(SubmissionEvaluator::new(
            task_repo.clone(),
            plugin_repo.clone(),
            result_repo.clone(),
            usage_repo.clone(),
            config.evaluator.clone(),
        ));

        Ok(AppState {
            task_repo,
            plugin_repo,
            result_repo,
            usage_repo,
            channels,
            evaluator,
            config: Arc::new(config.clone()),
        })
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Dispatcher => {
                let mut handles = self.spawn_dispatcher(&shutdown_rx);
                wait_all(&mut handles).await;
            }
            AppMode::Api => {
                self.run_api(shutdown_rx).await?;
            }
            AppMode::Worker => {
                self.run_worker(shutdown_rx).await?;
            }
            AppMode::All => {
                let mut handles = self.spawn_dispatcher(&shutdown_rx);
                self.run_api(shutdown_rx).await?;
                wait_all(&mut handles).await;
            }
        }
        Ok(())
    }

    /// 启动调度器、存活检测器和通道keepalive循环
    fn spawn_dispatcher(&self, shutdown_rx: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let state = self.state.as_ref().expect("调度器模式需要存储");

        let scheduler = Arc::new(AssignmentScheduler::new(
            state.task_repo.clone(),
            state.plugin_repo.clone(),
            state.channels.clone(),
            self.config.dispatcher.clone(),
        ));
        let detector = Arc::new(PluginLivenessDetector::new(
            state.plugin_repo.clone(),
            self.config.dispatcher.clone(),
        ));

        vec![
            tokio::spawn({
                let rx = shutdown_rx.resubscribe();
                async move { scheduler.start(rx).await }
            }),
            tokio::spawn({
                let rx = shutdown_rx.resubscribe();
                async move { detector.start(rx).await }
            }),
            state.channels.start_keepalive_loop(
                self.config.channel.keepalive_interval_seconds,
                shutdown_rx.resubscribe(),
            ),
        ]
    }

    async fn run_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let state = self.state.as_ref().expect("API模式需要存储").clone();
        let router = create_routes(state);
        let bind_address = &self.config.api.bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("API服务器监听 {bind_address}");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("API服务器运行失败")?;
        Ok(())
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let agent = PluginAgent::new(
            self.config.worker.clone(),
            Arc::new(SimulatedExecutor::new()),
        )
        .context("创建插件代理失败")?;
        agent.run(shutdown_rx).await.context("插件代理运行失败")?;
        Ok(())
    }
}

async fn wait_all(handles: &mut Vec<JoinHandle<()>>) {
    for handle in handles.drain(..) {
        if let Err(e) = handle.await {
            error!("后台组件异常退出: {e}");
        }
    }
}
