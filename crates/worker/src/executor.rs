use async_trait::async_trait;
use harvester_domain::entities::{Capability, ExtractedRecord, SubmissionStatus};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;

/// 一次提取执行的结果
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub status: SubmissionStatus,
    pub records: Vec<ExtractedRecord>,
    pub error_message: Option<String>,
}

/// 提取执行器抽象
///
/// 真正的DOM提取跑在浏览器扩展里，这个crate只定义契约并附带
/// 一个模拟实现用于联调和测试。执行器通过progress通道上报
/// 已处理数量，返回值是唯一的终态。
#[async_trait]
pub trait ExtractionExecutor: Send + Sync {
    async fn execute(
        &self,
        task_type: Capability,
        search_params: &serde_json::Value,
        max_results: i64,
        progress: mpsc::Sender<i64>,
    ) -> ExtractionOutcome;
}

/// 模拟执行器：生成假记录并按批上报进度
pub struct SimulatedExecutor {
    /// 每条记录的模拟耗时（毫秒），0表示立即返回
    pub delay_per_record_ms: u64,
    /// 模拟的失败概率（0.0-1.0）
    pub failure_rate: f64,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self {
            delay_per_record_ms: 50,
            failure_rate: 0.0,
        }
    }

    fn fake_record(task_type: Capability, index: i64) -> ExtractedRecord {
        let slug = format!("{}-{index}", task_type.as_str());
        ExtractedRecord {
            name: format!("模拟联系人 {index}"),
            linkedin_url: format!("https://www.linkedin.com/in/{slug}"),
            company: Some("模拟公司".to_string()),
            position: Some("软件工程师".to_string()),
            experience: None,
            about: None,
            location: Some("上海".to_string()),
        }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        task_type: Capability,
        search_params: &serde_json::Value,
        max_results: i64,
        progress: mpsc::Sender<i64>,
    ) -> ExtractionOutcome {
        debug!(
            "模拟执行 {} 提取, 参数: {}, 上限: {}",
            task_type, search_params, max_results
        );

        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            return ExtractionOutcome {
                status: SubmissionStatus::Failed,
                records: vec![],
                error_message: Some("模拟的页面加载失败".to_string()),
            };
        }

        let mut records = Vec::with_capacity(max_results as usize);
        for i in 0..max_results {
            if self.delay_per_record_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_per_record_ms))
                    .await;
            }
            records.push(Self::fake_record(task_type, i + 1));
            // 接收端不及时消费也不阻塞提取
            let _ = progress.try_send(i + 1);
        }

        ExtractionOutcome {
            status: SubmissionStatus::Completed,
            records,
            error_message: None,
        }
    }
}
