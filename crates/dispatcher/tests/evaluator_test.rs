use std::sync::Arc;

use chrono::{Duration, Utc};
use harvester_core::{config::EvaluatorConfig, HarvesterError};
use harvester_dispatcher::{Submission, SubmissionEvaluator};
use harvester_domain::{
    entities::{
        Capability, ExtractedRecord, ExtractionTask, Plugin, PluginStatus, RedemptionCode,
        SubmissionStatus, TaskStatus,
    },
    repositories::{PluginRepository, ResultRepository, TaskRepository, UsageRepository},
};
use harvester_infrastructure::{
    InMemoryPluginRepository, InMemoryResultRepository, InMemoryTaskRepository,
    InMemoryUsageRepository,
};
use serde_json::json;

struct Harness {
    task_repo: Arc<InMemoryTaskRepository>,
    plugin_repo: Arc<InMemoryPluginRepository>,
    result_repo: Arc<InMemoryResultRepository>,
    usage_repo: Arc<InMemoryUsageRepository>,
    evaluator: SubmissionEvaluator,
}

fn harness() -> Harness {
    let task_repo = Arc::new(InMemoryTaskRepository::new());
    let plugin_repo = Arc::new(InMemoryPluginRepository::new());
    let result_repo = Arc::new(InMemoryResultRepository::new());
    let usage_repo = Arc::new(InMemoryUsageRepository::new());
    let evaluator = SubmissionEvaluator::new(
        task_repo.clone(),
        plugin_repo.clone(),
        result_repo.clone(),
        usage_repo.clone(),
        EvaluatorConfig {
            max_batch_size: 100,
            max_results_cap: 1000,
        },
    );
    Harness {
        task_repo,
        plugin_repo,
        result_repo,
        usage_repo,
        evaluator,
    }
}

fn record(name: &str) -> ExtractedRecord {
    ExtractedRecord {
        name: name.to_string(),
        linkedin_url: format!("https://linkedin.com/in/{name}"),
        company: Some("Acme".to_string()),
        position: None,
        experience: None,
        about: None,
        location: None,
    }
}

/// 建一个已分配给plugin-a的任务，并注册插件与兑换码
async fn assigned_task(h: &Harness, code: &RedemptionCode) -> ExtractionTask {
    h.usage_repo.create(code).await.unwrap();
    h.plugin_repo
        .upsert(&Plugin::new(
            "plugin-a".to_string(),
            "1.0.0".to_string(),
            vec![Capability::PersonSearch],
        ))
        .await
        .unwrap();

    let task = ExtractionTask::new(
        Capability::PersonSearch,
        json!({"keywords": "rust"}),
        50,
        code.id.clone(),
        3,
    );
    let task = h.task_repo.create(&task).await.unwrap();
    h.task_repo
        .claim_pending(&task.id, "plugin-a", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    h.plugin_repo
        .set_status("plugin-a", PluginStatus::Busy)
        .await
        .unwrap();
    h.task_repo.find_by_id(&task.id).await.unwrap().unwrap()
}

fn completed_submission(task_id: &str, records: Vec<ExtractedRecord>) -> Submission {
    let n = records.len() as i64;
    Submission {
        task_id: task_id.to_string(),
        plugin_id: "plugin-a".to_string(),
        status: SubmissionStatus::Completed,
        records,
        processed_count: n,
        total_count: n,
        error_message: None,
    }
}

#[tokio::test]
async fn test_completed_submission_closes_task_and_charges_quota() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    let task = assigned_task(&h, &code).await;

    let records: Vec<ExtractedRecord> = (0..50).map(|i| record(&format!("p{i}"))).collect();
    let outcome = h
        .evaluator
        .handle_submission(completed_submission(&task.id, records))
        .await
        .unwrap();
    assert!(outcome.accepted);
    assert!(outcome.aggregate_quality > 0.0);

    let done = h.task_repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.usage_charged);

    // 配额扣减一次
    let charged = h.usage_repo.find_by_code("VIP2024").await.unwrap().unwrap();
    assert_eq!(charged.used_count, 1);

    // 插件释放并计入生涯统计
    let plugin = h.plugin_repo.find_by_id("plugin-a").await.unwrap().unwrap();
    assert_eq!(plugin.status, PluginStatus::Online);
    assert_eq!(plugin.total_tasks, 1);
    assert_eq!(plugin.successful_tasks, 1);

    // 胜出批次落库
    let winning = h.result_repo.find_winning(&task.id).await.unwrap().unwrap();
    assert_eq!(winning.result_count, 50);
}

#[tokio::test]
async fn test_duplicate_submission_charges_quota_once() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    let task = assigned_task(&h, &code).await;

    let first = completed_submission(&task.id, vec![record("alice")]);
    let second = first.clone();

    assert!(h.evaluator.handle_submission(first).await.unwrap().accepted);
    // 重复提交只留档，不再迁移状态也不再扣减
    let outcome = h.evaluator.handle_submission(second).await.unwrap();
    assert!(!outcome.accepted);

    let charged = h.usage_repo.find_by_code("VIP2024").await.unwrap().unwrap();
    assert_eq!(charged.used_count, 1);
    assert_eq!(h.result_repo.find_by_task(&task.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_submission_keeps_quota_untouched() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    let task = assigned_task(&h, &code).await;

    let submission = Submission {
        task_id: task.id.clone(),
        plugin_id: "plugin-a".to_string(),
        status: SubmissionStatus::Failed,
        records: vec![],
        processed_count: 0,
        total_count: 0,
        error_message: Some("页面加载失败".to_string()),
    };
    let outcome = h.evaluator.handle_submission(submission).await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.aggregate_quality, 0.0);

    let failed = h.task_repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("页面加载失败"));
    assert!(!failed.usage_charged);

    let code = h.usage_repo.find_by_code("VIP2024").await.unwrap().unwrap();
    assert_eq!(code.used_count, 0);

    // 失败计入生涯统计并压低评分
    let plugin = h.plugin_repo.find_by_id("plugin-a").await.unwrap().unwrap();
    assert_eq!(plugin.total_tasks, 1);
    assert_eq!(plugin.successful_tasks, 0);
    assert!(plugin.performance_score < 1.0);
}

#[tokio::test]
async fn test_partial_submission_does_not_charge() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    let task = assigned_task(&h, &code).await;

    let submission = Submission {
        task_id: task.id.clone(),
        plugin_id: "plugin-a".to_string(),
        status: SubmissionStatus::Partial,
        records: vec![record("alice")],
        processed_count: 1,
        total_count: 50,
        error_message: None,
    };
    assert!(h.evaluator.handle_submission(submission).await.unwrap().accepted);

    let partial = h.task_repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(partial.status, TaskStatus::Partial);
    assert!(!partial.usage_charged);
    let code = h.usage_repo.find_by_code("VIP2024").await.unwrap().unwrap();
    assert_eq!(code.used_count, 0);
}

#[tokio::test]
async fn test_submission_from_non_owner_after_reassignment() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    let task = assigned_task(&h, &code).await;

    // 超时回收后改派给plugin-b
    h.task_repo
        .reclaim_expired(&task.id, task.timeout_at.unwrap() + Duration::seconds(601))
        .await
        .unwrap();
    h.task_repo
        .claim_pending(&task.id, "plugin-b", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    // 原插件的迟到提交：留档但不动任务
    let late = completed_submission(&task.id, vec![record("alice")]);
    let outcome = h.evaluator.handle_submission(late).await.unwrap();
    assert!(!outcome.accepted);

    let current = h.task_repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Assigned);
    assert_eq!(current.assigned_plugin_id.as_deref(), Some("plugin-b"));

    let batches = h.result_repo.find_by_task(&task.id).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert!(!batches[0].winning);
}

#[tokio::test]
async fn test_invalid_batches_rejected() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    let task = assigned_task(&h, &code).await;

    // 已处理数超过总数
    let mut bad = completed_submission(&task.id, vec![record("alice")]);
    bad.processed_count = 10;
    bad.total_count = 5;
    assert!(matches!(
        h.evaluator.handle_submission(bad).await,
        Err(HarvesterError::InvalidBatch(_))
    ));

    // 记录缺少身份字段
    let mut invalid_record = record("bob");
    invalid_record.linkedin_url = String::new();
    let bad = completed_submission(&task.id, vec![invalid_record]);
    assert!(matches!(
        h.evaluator.handle_submission(bad).await,
        Err(HarvesterError::InvalidBatch(_))
    ));

    // 批次超过上限
    let oversized: Vec<ExtractedRecord> =
        (0..101).map(|i| record(&format!("p{i}"))).collect();
    let bad = completed_submission(&task.id, oversized);
    assert!(matches!(
        h.evaluator.handle_submission(bad).await,
        Err(HarvesterError::InvalidBatch(_))
    ));

    // 校验失败不落任何批次
    assert!(h.result_repo.find_by_task(&task.id).await.unwrap().is_empty());
    let untouched = h.task_repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Assigned);
}

#[tokio::test]
async fn test_submission_for_unknown_task() {
    let h = harness();
    let submission = completed_submission("no-such-task", vec![record("alice")]);
    assert!(matches!(
        h.evaluator.handle_submission(submission).await,
        Err(HarvesterError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn test_submission_for_never_assigned_task() {
    let h = harness();
    let code = RedemptionCode::new("VIP2024".to_string(), 10, 10, 50);
    h.usage_repo.create(&code).await.unwrap();
    let task = ExtractionTask::new(
        Capability::PersonSearch,
        json!({}),
        10,
        code.id.clone(),
        3,
    );
    let task = h.task_repo.create(&task).await.unwrap();

    let submission = completed_submission(&task.id, vec![record("alice")]);
    assert!(matches!(
        h.evaluator.handle_submission(submission).await,
        Err(HarvesterError::NotOwner { .. })
    ));
}
