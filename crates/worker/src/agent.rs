use std::sync::Arc;
use std::time::Duration;

use harvester_core::{
    config::WorkerConfig, retry::RetryPolicy, HarvesterError, HarvesterResult,
};
use harvester_domain::messages::PushMessage;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api_client::{HarvesterClient, TaskStream};
use crate::executor::ExtractionExecutor;

/// 插件代理
///
/// 单控制循环，同一时刻只执行一个任务：
/// 注册 → 打开推送通道（指数退避重连）→ 周期心跳。
/// 连续心跳失败触发重新注册；通道断开时本地放弃在途任务，
/// 由服务端的执行期限回收改派。
pub struct PluginAgent {
    client: Arc<HarvesterClient>,
    config: WorkerConfig,
    executor: Arc<dyn ExtractionExecutor>,
    reconnect: RetryPolicy,
    /// 当前执行中的任务ID，None表示空闲
    current_task: Arc<Mutex<Option<String>>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl PluginAgent {
    pub fn new(
        config: WorkerConfig,
        executor: Arc<dyn ExtractionExecutor>,
    ) -> HarvesterResult<Self> {
        let client = Arc::new(HarvesterClient::new(&config.server_url)?);
        let reconnect = RetryPolicy::from(&config.reconnect);
        Ok(Self {
            client,
            config,
            executor,
            reconnect,
            current_task: Arc::new(Mutex::new(None)),
            in_flight: Mutex::new(None),
        })
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> HarvesterResult<()> {
        loop {
            self.register_with_retry(&mut shutdown_rx).await?;
            let Some(mut stream) = self.connect_with_retry(&mut shutdown_rx).await? else {
                return Ok(());
            };
            info!("插件 {} 已连接，开始接收任务", self.config.plugin_id);

            let mut heartbeat_failures: u32 = 0;
            let mut ticker =
                interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("插件代理收到关闭信号，退出");
                        self.abandon_in_flight().await;
                        return Ok(());
                    }
                    _ = ticker.tick() => {
                        match self.send_heartbeat().await {
                            Ok(()) => heartbeat_failures = 0,
                            Err(e) => {
                                heartbeat_failures += 1;
                                warn!(
                                    "心跳失败 ({}/{}): {e}",
                                    heartbeat_failures, self.config.heartbeat_failure_threshold
                                );
                                if heartbeat_failures >= self.config.heartbeat_failure_threshold {
                                    warn!("连续心跳失败，重新注册");
                                    break;
                                }
                            }
                        }
                    }
                    message = stream.next_message() => {
                        match message {
                            Ok(Some(message)) => self.handle_message(message).await,
                            Ok(None) => {
                                warn!("推送通道被服务端关闭，准备重连");
                                break;
                            }
                            Err(e) => {
                                warn!("推送通道出错，准备重连: {e}");
                                break;
                            }
                        }
                    }
                }
            }

            // 重连前放弃在途任务，服务端期限到达后会改派
            self.abandon_in_flight().await;
        }
    }

    async fn handle_message(&self, message: PushMessage) {
        match message {
            PushMessage::ConnectionAck { server_version, .. } => {
                debug!("通道确认，服务端版本 {server_version}");
            }
            PushMessage::Keepalive { .. } => {}
            PushMessage::TaskAssignment {
                task_id,
                task_type,
                search_params,
                max_results,
                timeout_at,
                ..
            } => {
                let mut current = self.current_task.lock().await;
                if let Some(running) = current.as_deref() {
                    // 同一时刻只执行一个任务
                    warn!("正在执行任务 {running}，忽略新分配 {task_id}");
                    return;
                }
                info!("接受任务 {task_id} (类型 {task_type}, 期限 {timeout_at})");
                *current = Some(task_id.clone());
                drop(current);

                let handle = self.spawn_execution(task_id, task_type, search_params, max_results);
                *self.in_flight.lock().await = Some(handle);
            }
        }
    }

    fn spawn_execution(
        &self,
        task_id: String,
        task_type: harvester_domain::entities::Capability,
        search_params: serde_json::Value,
        max_results: i64,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let executor = self.executor.clone();
        let plugin_id = self.config.plugin_id.clone();
        let current_task = self.current_task.clone();
        let report_interval = Duration::from_secs(self.config.progress_report_interval_seconds);

        tokio::spawn(async move {
            let (progress_tx, progress_rx) = mpsc::channel::<i64>(64);
            let reporter = tokio::spawn(forward_progress(
                client.clone(),
                task_id.clone(),
                plugin_id.clone(),
                progress_rx,
                report_interval,
            ));

            let outcome = executor
                .execute(task_type, &search_params, max_results, progress_tx)
                .await;
            let _ = reporter.await;

            // 每个接受的任务恰好提交一次终态
            let processed_count = outcome.records.len() as i64;
            let submission = json!({
                "task_id": &task_id,
                "plugin_id": &plugin_id,
                "status": outcome.status,
                "records": outcome.records,
                "processed_count": processed_count,
                "total_count": max_results,
                "error_message": outcome.error_message,
            });
            match client.submit(&submission).await {
                Ok(response) if response.accepted => {
                    info!(
                        "任务 {task_id} 提交完成，质量分 {:.2}",
                        response.aggregate_quality
                    );
                }
                Ok(_) => warn!("任务 {task_id} 的提交未被采纳（迟到或已改派）"),
                Err(e) => error!("任务 {task_id} 提交失败: {e}"),
            }

            *current_task.lock().await = None;
        })
    }

    async fn send_heartbeat(&self) -> HarvesterResult<()> {
        let current = self.current_task.lock().await.clone();
        let status = if current.is_some() { "busy" } else { "online" };
        self.client
            .heartbeat(&self.config.plugin_id, status, current.as_deref())
            .await
    }

    async fn register_with_retry(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> HarvesterResult<()> {
        let mut attempt = 0;
        loop {
            match self
                .client
                .register(
                    &self.config.plugin_id,
                    &self.config.version,
                    &self.config.capabilities,
                )
                .await
            {
                Ok(response) => {
                    info!(
                        "插件 {} {}",
                        response.plugin_id,
                        if response.is_update { "刷新注册" } else { "注册成功" }
                    );
                    // 注册后立即心跳
                    let _ = self.send_heartbeat().await;
                    return Ok(());
                }
                Err(e) => {
                    if !self.reconnect.allows(attempt) {
                        return Err(HarvesterError::Network(format!(
                            "注册重试次数耗尽: {e}"
                        )));
                    }
                    let delay = self.reconnect.delay_for(attempt);
                    warn!("注册失败，{}ms后重试: {e}", delay.as_millis());
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => {
                            return Err(HarvesterError::Internal("注册被中断".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// 打开推送通道；收到关闭信号时返回None
    async fn connect_with_retry(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> HarvesterResult<Option<TaskStream>> {
        let mut attempt = 0;
        loop {
            match self.client.open_stream(&self.config.plugin_id).await {
                Ok(stream) => return Ok(Some(stream)),
                Err(e) => {
                    if !self.reconnect.allows(attempt) {
                        return Err(HarvesterError::Network(format!(
                            "推送通道重连次数耗尽: {e}"
                        )));
                    }
                    let delay = self.reconnect.delay_for(attempt);
                    warn!("建立推送通道失败，{}ms后重试: {e}", delay.as_millis());
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => return Ok(None),
                    }
                }
            }
        }
    }

    async fn abandon_in_flight(&self) {
        if let Some(handle) = self.in_flight.lock().await.take() {
            if !handle.is_finished() {
                warn!("放弃在途任务，等待服务端期限回收");
                handle.abort();
            }
        }
        *self.current_task.lock().await = None;
    }
}

/// 把执行器的进度按最小间隔转发给服务端
async fn forward_progress(
    client: Arc<HarvesterClient>,
    task_id: String,
    plugin_id: String,
    mut progress_rx: mpsc::Receiver<i64>,
    report_interval: Duration,
) {
    let mut last_report: Option<Instant> = None;
    while let Some(processed) = progress_rx.recv().await {
        let due = last_report
            .map(|at| at.elapsed() >= report_interval)
            .unwrap_or(true);
        if !due {
            continue;
        }
        if let Err(e) = client.report_progress(&task_id, &plugin_id, processed).await {
            debug!("进度上报失败（不影响执行）: {e}");
        }
        last_report = Some(Instant::now());
    }
}
