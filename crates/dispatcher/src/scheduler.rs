use std::sync::Arc;

use chrono::{Duration, Utc};
use harvester_core::{config::DispatcherConfig, HarvesterResult};
use harvester_domain::{
    entities::{ExtractionTask, PluginStatus},
    messages::PushMessage,
    repositories::{PluginRepository, TaskRepository},
};
use harvester_infrastructure::PushChannelManager;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 单次调度取出的待分配任务上限
const SCHEDULE_BATCH_SIZE: i64 = 50;

/// 任务分配调度器
///
/// 周期性执行两个阶段：把pending任务分配给最合适的在线插件，
/// 以及回收超过执行期限的任务。所有状态迁移都走仓储层的条件更新，
/// 竞争落败按预期冲突跳过，不视为错误。
pub struct AssignmentScheduler {
    task_repo: Arc<dyn TaskRepository>,
    plugin_repo: Arc<dyn PluginRepository>,
    channels: Arc<PushChannelManager>,
    config: DispatcherConfig,
}

impl AssignmentScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        plugin_repo: Arc<dyn PluginRepository>,
        channels: Arc<PushChannelManager>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            task_repo,
            plugin_repo,
            channels,
            config,
        }
    }

    /// 分配阶段：按先进先出遍历pending任务，逐个尝试分配。
    /// 返回本轮成功分配的任务数。
    pub async fn run_assignment_pass(&self) -> HarvesterResult<usize> {
        let pending = self.task_repo.find_pending(SCHEDULE_BATCH_SIZE).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!("发现 {} 个待分配任务", pending.len());

        let mut assigned = 0;
        for task in &pending {
            if self.try_assign(task).await? {
                assigned += 1;
            }
        }
        if assigned > 0 {
            info!("本轮调度分配了 {} 个任务", assigned);
        }
        Ok(assigned)
    }

    /// 为单个任务挑选插件并完成认领和推送。
    /// 候选按评分降序逐个尝试，全部失败则留待下一轮。
    async fn try_assign(&self, task: &ExtractionTask) -> HarvesterResult<bool> {
        let now = Utc::now();
        let candidates = self
            .plugin_repo
            .list_eligible(task.task_type, now, self.config.liveness_window_seconds)
            .await?;
        if candidates.is_empty() {
            debug!("任务 {} 暂无具备 {} 能力的可用插件", task.id, task.task_type);
            return Ok(false);
        }

        let timeout_at = now + Duration::seconds(self.config.assignment_timeout_seconds);
        for plugin in &candidates {
            let claimed = self
                .task_repo
                .claim_pending(&task.id, &plugin.plugin_id, timeout_at)
                .await?;
            if !claimed {
                // 任务已被并发的调度循环认领或被取消
                debug!("任务 {} 认领竞争落败，跳过", task.id);
                return Ok(false);
            }

            self.plugin_repo
                .set_status(&plugin.plugin_id, PluginStatus::Busy)
                .await?;

            let message = PushMessage::task_assignment(
                &task.id,
                task.task_type,
                task.search_params.clone(),
                task.max_results,
                timeout_at,
            );
            match self.channels.send(&plugin.plugin_id, message).await {
                Ok(()) => {
                    info!(
                        "任务 {} 已分配给插件 {} (评分 {:.2})",
                        task.id, plugin.plugin_id, plugin.performance_score
                    );
                    return Ok(true);
                }
                Err(e) => {
                    // 推送失败回滚认领，换下一个候选
                    warn!("向插件 {} 推送任务 {} 失败: {e}", plugin.plugin_id, task.id);
                    self.task_repo.release_claim(&task.id).await?;
                    self.plugin_repo
                        .set_status(&plugin.plugin_id, PluginStatus::Online)
                        .await?;
                }
            }
        }
        Ok(false)
    }

    /// 回收阶段：超过期限的任务重新入队或判死，并释放占用的插件。
    /// 返回（重新入队数，判死数）。
    pub async fn run_reclaim_pass(&self) -> HarvesterResult<(usize, usize)> {
        let now = Utc::now();
        let expired = self.task_repo.find_expired(now).await?;
        if expired.is_empty() {
            return Ok((0, 0));
        }

        let mut requeued = 0;
        let mut failed = 0;
        for task in &expired {
            let holder = task.assigned_plugin_id.clone();
            let exhausted = task.retry_count >= task.max_retries;
            let reclaimed = if exhausted {
                let done = self
                    .task_repo
                    .fail_expired(&task.id, now, "任务执行超时且重试次数耗尽")
                    .await?;
                if done {
                    warn!("任务 {} 超时且重试耗尽，标记为失败", task.id);
                    failed += 1;
                }
                done
            } else {
                let done = self.task_repo.reclaim_expired(&task.id, now).await?;
                if done {
                    info!(
                        "任务 {} 超时回收，重新入队 (第 {} 次重试)",
                        task.id,
                        task.retry_count + 1
                    );
                    requeued += 1;
                }
                done
            };

            // 插件可能早已离线，释放失败只记录
            if reclaimed {
                if let Some(plugin_id) = holder {
                    if let Err(e) = self
                        .plugin_repo
                        .set_status(&plugin_id, PluginStatus::Online)
                        .await
                    {
                        warn!("释放插件 {plugin_id} 失败: {e}");
                    }
                }
            }
        }
        Ok((requeued, failed))
    }

    /// 启动调度循环，直到收到关闭信号。
    /// 单飞行：一轮没跑完时不会叠加下一轮。
    pub async fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.schedule_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "任务分配调度器启动，调度间隔 {} 秒",
            self.config.schedule_interval_seconds
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_assignment_pass().await {
                        error!("调度分配阶段出错: {e}");
                    }
                    if let Err(e) = self.run_reclaim_pass().await {
                        error!("超时回收阶段出错: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("任务分配调度器收到关闭信号，退出");
                    break;
                }
            }
        }
    }
}
