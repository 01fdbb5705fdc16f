//! 仓储抽象
//!
//! 定义数据访问的抽象接口。所有状态迁移方法都是条件更新语义：
//! 返回`true`表示本次调用完成了迁移，`false`表示前置条件不再满足
//! （竞争中落败、记录不存在等），调用方据此决定跳过还是换候选重试。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvester_core::HarvesterResult;

use crate::entities::{
    Capability, CodeValidation, ExtractionTask, Plugin, PluginStatus, RedemptionCode, ResultBatch,
    TaskStatus,
};

/// 任务队列仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &ExtractionTask) -> HarvesterResult<ExtractionTask>;

    async fn find_by_id(&self, id: &str) -> HarvesterResult<Option<ExtractionTask>>;

    /// 按创建时间先进先出取待分配任务
    async fn find_pending(&self, limit: i64) -> HarvesterResult<Vec<ExtractionTask>>;

    /// 原子认领：仅当任务仍为pending时迁移到assigned并设置期限。
    /// 并发调度循环下每个任务至多被认领一次。
    async fn claim_pending(
        &self,
        id: &str,
        plugin_id: &str,
        timeout_at: DateTime<Utc>,
    ) -> HarvesterResult<bool>;

    /// 回滚认领：推送失败时assigned→pending，不计入重试次数
    async fn release_claim(&self, id: &str) -> HarvesterResult<bool>;

    /// 归属插件的进度上报。首次上报完成assigned→processing并记录started_at，
    /// 之后只更新processed_count。
    async fn record_progress(
        &self,
        id: &str,
        plugin_id: &str,
        processed_count: i64,
    ) -> HarvesterResult<bool>;

    /// 归属插件的终态提交：assigned/processing→终态，恰好生效一次
    async fn finalize(
        &self,
        id: &str,
        plugin_id: &str,
        status: TaskStatus,
        processed_count: i64,
        error_message: Option<&str>,
    ) -> HarvesterResult<bool>;

    /// 超过期限仍未结束的assigned/processing任务
    async fn find_expired(&self, now: DateTime<Utc>) -> HarvesterResult<Vec<ExtractionTask>>;

    /// 超时回收：仍过期且非终态时重新入队并累加重试计数
    async fn reclaim_expired(&self, id: &str, now: DateTime<Utc>) -> HarvesterResult<bool>;

    /// 超时判死：重试耗尽后置为failed
    async fn fail_expired(
        &self,
        id: &str,
        now: DateTime<Utc>,
        error_message: &str,
    ) -> HarvesterResult<bool>;

    /// 取消任务。任务已是终态时返回Conflict错误，不存在时返回TaskNotFound。
    async fn cancel(&self, id: &str) -> HarvesterResult<ExtractionTask>;

    /// 将任务的配额扣减标记从0翻转为1。返回true的那次调用方可扣减配额，
    /// 重复提交由此保证恰好扣减一次。
    async fn charge_usage(&self, id: &str) -> HarvesterResult<bool>;
}

/// 插件注册表仓储
#[async_trait]
pub trait PluginRepository: Send + Sync {
    /// 幂等注册。返回true表示首次注册，false表示刷新已有记录。
    async fn upsert(&self, plugin: &Plugin) -> HarvesterResult<bool>;

    async fn find_by_id(&self, id: &str) -> HarvesterResult<Option<Plugin>>;

    /// 更新心跳时间与状态。返回false表示插件从未注册。
    async fn heartbeat(
        &self,
        id: &str,
        status: PluginStatus,
        now: DateTime<Utc>,
    ) -> HarvesterResult<bool>;

    /// 可分配插件：online、心跳在窗口内、具备该能力，
    /// 按评分降序、同分按心跳新旧排序。
    async fn list_eligible(
        &self,
        capability: Capability,
        now: DateTime<Utc>,
        liveness_window_seconds: i64,
    ) -> HarvesterResult<Vec<Plugin>>;

    async fn set_status(&self, id: &str, status: PluginStatus) -> HarvesterResult<bool>;

    /// 任务结束后更新插件的生涯统计与EWMA评分
    async fn apply_task_result(&self, id: &str, success: bool, alpha: f64)
        -> HarvesterResult<bool>;

    /// 将心跳过期的插件显式标记为offline，返回受影响数量
    async fn mark_stale_offline(
        &self,
        now: DateTime<Utc>,
        liveness_window_seconds: i64,
    ) -> HarvesterResult<u64>;
}

/// 结果批次仓储
#[async_trait]
pub trait ResultRepository: Send + Sync {
    async fn save(&self, batch: &ResultBatch) -> HarvesterResult<ResultBatch>;

    async fn find_by_task(&self, task_id: &str) -> HarvesterResult<Vec<ResultBatch>>;

    /// 任务的胜出批次（使任务进入终态的那次提交）
    async fn find_winning(&self, task_id: &str) -> HarvesterResult<Option<ResultBatch>>;
}

/// 兑换码（配额）仓储
#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn create(&self, code: &RedemptionCode) -> HarvesterResult<RedemptionCode>;

    async fn find_by_code(&self, code: &str) -> HarvesterResult<Option<RedemptionCode>>;

    /// 校验兑换码并返回额度信息。总量耗尽、日额度耗尽或请求超过单次上限
    /// 都返回QuotaExhausted；未知兑换码返回CodeNotFound。
    async fn validate(
        &self,
        code: &str,
        now: DateTime<Utc>,
        requested_results: i64,
    ) -> HarvesterResult<CodeValidation>;

    /// 扣减一次使用量（含日窗口滚动）。返回false表示兑换码不存在。
    async fn consume(&self, code_id: &str, now: DateTime<Utc>) -> HarvesterResult<bool>;
}
