//! 内存仓储实现
//!
//! 与SQLite实现遵守同一套条件更新契约，用于嵌入式试运行和测试。
//! 每个仓储用单把互斥锁守护整张表，认领等复合检查在锁内完成，
//! 因此与数据库实现一样是按任务线性化的。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::{
    entities::{
        Capability, CodeValidation, ExtractionTask, Plugin, PluginStatus, RedemptionCode,
        ResultBatch, TaskStatus,
    },
    repositories::{PluginRepository, ResultRepository, TaskRepository, UsageRepository},
};

use crate::database::sqlite::check_quota;

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<String, ExtractionTask>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &ExtractionTask) -> HarvesterResult<ExtractionTask> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(HarvesterError::DatabaseOperation(format!(
                "任务ID重复: {}",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task.clone())
    }

    async fn find_by_id(&self, id: &str) -> HarvesterResult<Option<ExtractionTask>> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn find_pending(&self, limit: i64) -> HarvesterResult<Vec<ExtractionTask>> {
        let tasks = self.tasks.lock().unwrap();
        let mut pending: Vec<ExtractionTask> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn claim_pending(
        &self,
        id: &str,
        plugin_id: &str,
        timeout_at: DateTime<Utc>,
    ) -> HarvesterResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Assigned;
                task.assigned_plugin_id = Some(plugin_id.to_string());
                task.assigned_at = Some(Utc::now());
                task.timeout_at = Some(timeout_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, id: &str) -> HarvesterResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.status = TaskStatus::Pending;
                task.assigned_plugin_id = None;
                task.assigned_at = None;
                task.timeout_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        id: &str,
        plugin_id: &str,
        processed_count: i64,
    ) -> HarvesterResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task)
                if task.assigned_plugin_id.as_deref() == Some(plugin_id)
                    && matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) =>
            {
                task.status = TaskStatus::Processing;
                task.started_at.get_or_insert_with(Utc::now);
                task.processed_count = processed_count.min(task.max_results);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(
        &self,
        id: &str,
        plugin_id: &str,
        status: TaskStatus,
        processed_count: i64,
        error_message: Option<&str>,
    ) -> HarvesterResult<bool> {
        if !status.is_terminal() || status == TaskStatus::Cancelled {
            return Err(HarvesterError::Validation(format!(
                "finalize只接受提交终态: {status}"
            )));
        }
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task)
                if task.assigned_plugin_id.as_deref() == Some(plugin_id)
                    && matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) =>
            {
                task.status = status;
                task.processed_count = processed_count.min(task.max_results);
                task.error_message = error_message.map(str::to_string);
                task.completed_at = Some(Utc::now());
                task.assigned_plugin_id = None;
                task.timeout_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> HarvesterResult<Vec<ExtractionTask>> {
        let tasks = self.tasks.lock().unwrap();
        let mut expired: Vec<ExtractionTask> = tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::Processing)
                    && t.timeout_at.is_some_and(|deadline| deadline < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.timeout_at);
        Ok(expired)
    }

    async fn reclaim_expired(&self, id: &str, now: DateTime<Utc>) -> HarvesterResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task)
                if matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing)
                    && task.timeout_at.is_some_and(|deadline| deadline < now) =>
            {
                task.status = TaskStatus::Pending;
                task.assigned_plugin_id = None;
                task.assigned_at = None;
                task.started_at = None;
                task.timeout_at = None;
                task.retry_count += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_expired(
        &self,
        id: &str,
        now: DateTime<Utc>,
        error_message: &str,
    ) -> HarvesterResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task)
                if matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing)
                    && task.timeout_at.is_some_and(|deadline| deadline < now) =>
            {
                task.status = TaskStatus::Failed;
                task.assigned_plugin_id = None;
                task.timeout_at = None;
                task.completed_at = Some(now);
                task.error_message = Some(error_message.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: &str) -> HarvesterResult<ExtractionTask> {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(id) else {
            return Err(HarvesterError::TaskNotFound { id: id.to_string() });
        };
        if task.is_terminal() {
            return Err(HarvesterError::Conflict(format!(
                "任务 {id} 已处于终态，无法取消"
            )));
        }
        let before = task.clone();
        task.status = TaskStatus::Cancelled;
        task.assigned_plugin_id = None;
        task.timeout_at = None;
        task.completed_at = Some(Utc::now());

        Ok(ExtractionTask {
            status: TaskStatus::Cancelled,
            completed_at: task.completed_at,
            ..before
        })
    }

    async fn charge_usage(&self, id: &str) -> HarvesterResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task) if !task.usage_charged => {
                task.usage_charged = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryPluginRepository {
    plugins: Mutex<HashMap<String, Plugin>>,
}

impl InMemoryPluginRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PluginRepository for InMemoryPluginRepository {
    async fn upsert(&self, plugin: &Plugin) -> HarvesterResult<bool> {
        let mut plugins = self.plugins.lock().unwrap();
        match plugins.get_mut(&plugin.plugin_id) {
            Some(existing) => {
                existing.version = plugin.version.clone();
                existing.capabilities = plugin.capabilities.clone();
                existing.status = PluginStatus::Online;
                existing.last_heartbeat = Utc::now();
                Ok(false)
            }
            None => {
                plugins.insert(plugin.plugin_id.clone(), plugin.clone());
                Ok(true)
            }
        }
    }

    async fn find_by_id(&self, id: &str) -> HarvesterResult<Option<Plugin>> {
        Ok(self.plugins.lock().unwrap().get(id).cloned())
    }

    async fn heartbeat(
        &self,
        id: &str,
        status: PluginStatus,
        now: DateTime<Utc>,
    ) -> HarvesterResult<bool> {
        let mut plugins = self.plugins.lock().unwrap();
        match plugins.get_mut(id) {
            Some(plugin) => {
                plugin.last_heartbeat = now;
                plugin.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_eligible(
        &self,
        capability: Capability,
        now: DateTime<Utc>,
        liveness_window_seconds: i64,
    ) -> HarvesterResult<Vec<Plugin>> {
        let plugins = self.plugins.lock().unwrap();
        let mut eligible: Vec<Plugin> = plugins
            .values()
            .filter(|p| p.is_eligible(now, liveness_window_seconds) && p.supports(capability))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.performance_score
                .partial_cmp(&a.performance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_heartbeat.cmp(&a.last_heartbeat))
        });
        Ok(eligible)
    }

    async fn set_status(&self, id: &str, status: PluginStatus) -> HarvesterResult<bool> {
        let mut plugins = self.plugins.lock().unwrap();
        match plugins.get_mut(id) {
            Some(plugin) => {
                plugin.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_task_result(
        &self,
        id: &str,
        success: bool,
        alpha: f64,
    ) -> HarvesterResult<bool> {
        let mut plugins = self.plugins.lock().unwrap();
        match plugins.get_mut(id) {
            Some(plugin) => {
                plugin.apply_result(success, alpha);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_stale_offline(
        &self,
        now: DateTime<Utc>,
        liveness_window_seconds: i64,
    ) -> HarvesterResult<u64> {
        let cutoff = now - Duration::seconds(liveness_window_seconds);
        let mut plugins = self.plugins.lock().unwrap();
        let mut affected = 0;
        for plugin in plugins.values_mut() {
            if plugin.status != PluginStatus::Offline && plugin.last_heartbeat < cutoff {
                plugin.status = PluginStatus::Offline;
                affected += 1;
            }
        }
        Ok(affected)
    }
}

#[derive(Default)]
pub struct InMemoryResultRepository {
    batches: Mutex<Vec<ResultBatch>>,
}

impl InMemoryResultRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultRepository for InMemoryResultRepository {
    async fn save(&self, batch: &ResultBatch) -> HarvesterResult<ResultBatch> {
        let mut batches = self.batches.lock().unwrap();
        let saved = ResultBatch {
            id: batches.len() as i64 + 1,
            ..batch.clone()
        };
        batches.push(saved.clone());
        Ok(saved)
    }

    async fn find_by_task(&self, task_id: &str) -> HarvesterResult<Vec<ResultBatch>> {
        let batches = self.batches.lock().unwrap();
        Ok(batches
            .iter()
            .filter(|b| b.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn find_winning(&self, task_id: &str) -> HarvesterResult<Option<ResultBatch>> {
        let batches = self.batches.lock().unwrap();
        Ok(batches
            .iter()
            .find(|b| b.task_id == task_id && b.winning)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryUsageRepository {
    codes: Mutex<HashMap<String, RedemptionCode>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn create(&self, code: &RedemptionCode) -> HarvesterResult<RedemptionCode> {
        let mut codes = self.codes.lock().unwrap();
        codes.insert(code.id.clone(), code.clone());
        Ok(code.clone())
    }

    async fn find_by_code(&self, code: &str) -> HarvesterResult<Option<RedemptionCode>> {
        let codes = self.codes.lock().unwrap();
        Ok(codes.values().find(|c| c.code == code).cloned())
    }

    async fn validate(
        &self,
        code: &str,
        now: DateTime<Utc>,
        requested_results: i64,
    ) -> HarvesterResult<CodeValidation> {
        let Some(record) = self.find_by_code(code).await? else {
            return Err(HarvesterError::CodeNotFound {
                code: code.to_string(),
            });
        };
        check_quota(&record, now, requested_results)
    }

    async fn consume(&self, code_id: &str, now: DateTime<Utc>) -> HarvesterResult<bool> {
        let mut codes = self.codes.lock().unwrap();
        match codes.get_mut(code_id) {
            Some(code) => {
                code.used_count += 1;
                if now.date_naive() > code.daily_reset_at.date_naive() {
                    code.daily_used = 1;
                    code.daily_reset_at = now;
                } else {
                    code.daily_used += 1;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
