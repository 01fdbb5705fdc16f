use std::sync::Arc;

use chrono::Utc;
use harvester_core::{config::EvaluatorConfig, HarvesterError, HarvesterResult};
use harvester_domain::{
    entities::{ExtractedRecord, ExtractionTask, PluginStatus, ResultBatch, SubmissionStatus},
    repositories::{PluginRepository, ResultRepository, TaskRepository, UsageRepository},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// EWMA评分的学习率
const SCORE_ALPHA: f64 = 0.2;

/// 插件的一次结果提交
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: String,
    pub plugin_id: String,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub records: Vec<ExtractedRecord>,
    pub processed_count: i64,
    pub total_count: i64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// 提交的处理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    /// 是否为胜出提交（完成了任务的终态迁移）
    pub accepted: bool,
    /// 批次的平均质量分
    pub aggregate_quality: f64,
}

/// 提交评估器
///
/// 校验插件提交的结果批次、计算质量分、完成任务的终态迁移，
/// 并在任务完成时恰好扣减一次配额。归属权丢失的迟到提交
/// 只留档不改任务状态，先到的终态生效。
pub struct SubmissionEvaluator {
    task_repo: Arc<dyn TaskRepository>,
    plugin_repo: Arc<dyn PluginRepository>,
    result_repo: Arc<dyn ResultRepository>,
    usage_repo: Arc<dyn UsageRepository>,
    config: EvaluatorConfig,
}

impl SubmissionEvaluator {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        plugin_repo: Arc<dyn PluginRepository>,
        result_repo: Arc<dyn ResultRepository>,
        usage_repo: Arc<dyn UsageRepository>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            task_repo,
            plugin_repo,
            result_repo,
            usage_repo,
            config,
        }
    }

    pub async fn handle_submission(
        &self,
        submission: Submission,
    ) -> HarvesterResult<SubmissionOutcome> {
        self.validate_batch(&submission)?;

        let task = self
            .task_repo
            .find_by_id(&submission.task_id)
            .await?
            .ok_or_else(|| HarvesterError::TaskNotFound {
                id: submission.task_id.clone(),
            })?;

        let quality = Self::aggregate_quality(&submission.records);

        // 从未被分配过的任务收不到合法提交
        if task.assigned_at.is_none() {
            return Err(HarvesterError::NotOwner {
                task_id: submission.task_id,
                plugin_id: submission.plugin_id,
            });
        }

        // 任务已结束或已改派给其他插件：留档但不动任务状态
        if task.is_terminal() || task.assigned_plugin_id.as_deref() != Some(&submission.plugin_id)
        {
            warn!(
                "任务 {} 收到插件 {} 的迟到提交 (当前状态 {})，仅留档",
                task.id, submission.plugin_id, task.status
            );
            self.persist_batch(&submission, quality, false).await?;
            return Ok(SubmissionOutcome {
                accepted: false,
                aggregate_quality: quality,
            });
        }

        let finalized = self
            .task_repo
            .finalize(
                &submission.task_id,
                &submission.plugin_id,
                submission.status.into(),
                submission.processed_count,
                submission.error_message.as_deref(),
            )
            .await?;
        if !finalized {
            // 终态迁移竞争落败（取消或超时回收抢先）
            warn!("任务 {} 的终态迁移竞争落败，提交仅留档", task.id);
            self.persist_batch(&submission, quality, false).await?;
            return Ok(SubmissionOutcome {
                accepted: false,
                aggregate_quality: quality,
            });
        }

        self.persist_batch(&submission, quality, true).await?;
        self.settle_plugin(&submission).await?;
        if submission.status == SubmissionStatus::Completed {
            self.charge_quota(&task).await?;
        }

        info!(
            "任务 {} 由插件 {} 提交为 {}，质量分 {:.2}",
            task.id,
            submission.plugin_id,
            submission.status_label(),
            quality
        );
        Ok(SubmissionOutcome {
            accepted: true,
            aggregate_quality: quality,
        })
    }

    fn validate_batch(&self, submission: &Submission) -> HarvesterResult<()> {
        if submission.records.len() > self.config.max_batch_size {
            return Err(HarvesterError::InvalidBatch(format!(
                "批次大小 {} 超过上限 {}",
                submission.records.len(),
                self.config.max_batch_size
            )));
        }
        if submission.processed_count > submission.total_count {
            return Err(HarvesterError::InvalidBatch(format!(
                "已处理数 {} 超过总数 {}",
                submission.processed_count, submission.total_count
            )));
        }
        for record in &submission.records {
            record.validate()?;
        }
        Ok(())
    }

    /// 批次平均质量分；空批次记0分
    fn aggregate_quality(records: &[ExtractedRecord]) -> f64 {
        if records.is_empty() {
            return 0.0;
        }
        let sum: f64 = records.iter().map(ExtractedRecord::completeness).sum();
        sum / records.len() as f64
    }

    async fn persist_batch(
        &self,
        submission: &Submission,
        quality: f64,
        winning: bool,
    ) -> HarvesterResult<()> {
        let batch = ResultBatch {
            id: 0,
            task_id: submission.task_id.clone(),
            plugin_id: submission.plugin_id.clone(),
            result_data: serde_json::to_value(&submission.records)
                .map_err(|e| HarvesterError::Serialization(e.to_string()))?,
            result_count: submission.records.len() as i64,
            quality_score: quality,
            winning,
            created_at: Utc::now(),
        };
        self.result_repo.save(&batch).await?;
        Ok(())
    }

    /// 释放插件并更新生涯统计与评分
    async fn settle_plugin(&self, submission: &Submission) -> HarvesterResult<()> {
        let success = submission.status == SubmissionStatus::Completed;
        self.plugin_repo
            .apply_task_result(&submission.plugin_id, success, SCORE_ALPHA)
            .await?;
        self.plugin_repo
            .set_status(&submission.plugin_id, PluginStatus::Online)
            .await?;
        Ok(())
    }

    /// usage_charged标记保证重复提交下配额恰好扣减一次
    async fn charge_quota(&self, task: &ExtractionTask) -> HarvesterResult<()> {
        if self.task_repo.charge_usage(&task.id).await? {
            if !self.usage_repo.consume(&task.code_id, Utc::now()).await? {
                warn!("任务 {} 的兑换码 {} 不存在，配额未扣减", task.id, task.code_id);
            }
        }
        Ok(())
    }
}

impl Submission {
    fn status_label(&self) -> &'static str {
        match self.status {
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Partial => "partial",
            SubmissionStatus::Failed => "failed",
        }
    }
}
