use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use harvester_core::HarvesterError;
use serde::{Deserialize, Serialize};

/// 提取任务
///
/// 任务队列中的一个工作单元，由调用方创建、调度器分配、插件执行。
/// 状态机见 `TaskStatus`，所有状态变更都通过仓储层的条件更新完成。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionTask {
    pub id: String,
    pub task_type: Capability,
    pub search_params: serde_json::Value,
    pub max_results: i64,
    pub status: TaskStatus,
    pub assigned_plugin_id: Option<String>,
    /// 创建该任务所消耗的兑换码ID
    pub code_id: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub processed_count: i64,
    /// 配额是否已扣减，保证completed任务恰好扣减一次
    pub usage_charged: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl ExtractionTask {
    pub fn new(
        task_type: Capability,
        search_params: serde_json::Value,
        max_results: i64,
        code_id: String,
        max_retries: i32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            search_params,
            max_results,
            status: TaskStatus::Pending,
            assigned_plugin_id: None,
            code_id,
            retry_count: 0,
            max_retries,
            processed_count: 0,
            usage_charged: false,
            error_message: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            timeout_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 进度百分比（0-100）
    pub fn progress(&self) -> i64 {
        if self.max_results <= 0 {
            return 0;
        }
        (self.processed_count * 100 / self.max_results).min(100)
    }
}

/// 任务状态机
///
/// pending → assigned → processing → {completed | partial | failed}，
/// 任一非终态可被取消。终态之间不再迁移（先到的终态生效）。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Partial | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 校验状态迁移是否合法
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, next) {
            (Pending, Assigned) => true,
            (Assigned, Processing) => true,
            // 超时回收：重新入队
            (Assigned, Pending) | (Processing, Pending) => true,
            (Assigned, Completed | Partial | Failed) => true,
            (Processing, Completed | Partial | Failed) => true,
            (Pending | Assigned | Processing, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = HarvesterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "partial" => Ok(TaskStatus::Partial),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(HarvesterError::Validation(format!("无效的任务状态: {s}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 提交的终态，是TaskStatus终态的子集（不含cancelled）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Completed,
    Partial,
    Failed,
}

impl From<SubmissionStatus> for TaskStatus {
    fn from(status: SubmissionStatus) -> Self {
        match status {
            SubmissionStatus::Completed => TaskStatus::Completed,
            SubmissionStatus::Partial => TaskStatus::Partial,
            SubmissionStatus::Failed => TaskStatus::Failed,
        }
    }
}

/// 能力标签，决定插件可以接收哪些类型的任务
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    PersonSearch,
    CompanySearch,
    CompanyEmployees,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::PersonSearch => "person-search",
            Capability::CompanySearch => "company-search",
            Capability::CompanyEmployees => "company-employees",
        }
    }
}

impl FromStr for Capability {
    type Err = HarvesterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "person-search" => Ok(Capability::PersonSearch),
            "company-search" => Ok(Capability::CompanySearch),
            "company-employees" => Ok(Capability::CompanyEmployees),
            _ => Err(HarvesterError::InvalidCapability(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已注册的插件（浏览器端执行器）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plugin {
    pub plugin_id: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
    pub status: PluginStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub total_tasks: i64,
    pub successful_tasks: i64,
    /// 成功率的指数加权滑动平均，只微调不重置
    pub performance_score: f64,
    pub registered_at: DateTime<Utc>,
}

impl Plugin {
    pub const MIN_ID_LEN: usize = 3;
    pub const MAX_ID_LEN: usize = 100;

    pub fn new(plugin_id: String, version: String, capabilities: Vec<Capability>) -> Self {
        let now = Utc::now();
        Self {
            plugin_id,
            version,
            capabilities,
            status: PluginStatus::Online,
            last_heartbeat: now,
            total_tasks: 0,
            successful_tasks: 0,
            performance_score: 1.0,
            registered_at: now,
        }
    }

    /// 校验插件ID的长度和字符约束
    pub fn validate_id(id: &str) -> Result<(), HarvesterError> {
        if id.len() < Self::MIN_ID_LEN || id.len() > Self::MAX_ID_LEN {
            return Err(HarvesterError::InvalidPluginId(format!(
                "插件ID长度必须在{}-{}之间: {id}",
                Self::MIN_ID_LEN,
                Self::MAX_ID_LEN
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HarvesterError::InvalidPluginId(format!(
                "插件ID只允许字母、数字、连字符和下划线: {id}"
            )));
        }
        Ok(())
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// 分配资格：状态online且心跳在存活窗口内
    pub fn is_eligible(&self, now: DateTime<Utc>, liveness_window_seconds: i64) -> bool {
        self.status == PluginStatus::Online
            && (now - self.last_heartbeat).num_seconds() <= liveness_window_seconds
    }

    /// 任务结束后更新统计与EWMA评分
    pub fn apply_result(&mut self, success: bool, alpha: f64) {
        self.total_tasks += 1;
        if success {
            self.successful_tasks += 1;
        }
        let outcome = if success { 1.0 } else { 0.0 };
        self.performance_score = (1.0 - alpha) * self.performance_score + alpha * outcome;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Online,
    Busy,
    Offline,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Online => "online",
            PluginStatus::Busy => "busy",
            PluginStatus::Offline => "offline",
        }
    }
}

impl FromStr for PluginStatus {
    type Err = HarvesterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PluginStatus::Online),
            "busy" => Ok(PluginStatus::Busy),
            // 原始扩展上报idle，等价于online
            "idle" => Ok(PluginStatus::Online),
            "offline" => Ok(PluginStatus::Offline),
            _ => Err(HarvesterError::Validation(format!("无效的插件状态: {s}"))),
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次提交产生的结果批次
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultBatch {
    pub id: i64,
    pub task_id: String,
    pub plugin_id: String,
    pub result_data: serde_json::Value,
    pub result_count: i64,
    pub quality_score: f64,
    /// 是否为任务的胜出批次（使任务进入终态的那一次提交）
    pub winning: bool,
    pub created_at: DateTime<Utc>,
}

/// 单条提取记录
///
/// name和linkedin_url是身份字段，缺失即判定记录无效；
/// 质量分为期望字段的完整度比例。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedRecord {
    pub name: String,
    pub linkedin_url: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub experience: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl ExtractedRecord {
    /// 期望字段总数（含两个身份字段）
    const EXPECTED_FIELDS: f64 = 7.0;

    pub fn validate(&self) -> Result<(), HarvesterError> {
        if self.name.trim().is_empty() {
            return Err(HarvesterError::InvalidBatch("记录缺少name字段".to_string()));
        }
        if self.linkedin_url.trim().is_empty() {
            return Err(HarvesterError::InvalidBatch(
                "记录缺少linkedin_url字段".to_string(),
            ));
        }
        Ok(())
    }

    /// 完整度比例：已填写的期望字段数 / 期望字段总数
    pub fn completeness(&self) -> f64 {
        let optional_present = [
            &self.company,
            &self.position,
            &self.experience,
            &self.about,
            &self.location,
        ]
        .iter()
        .filter(|f| f.as_deref().is_some_and(|v| !v.trim().is_empty()))
        .count();
        (2.0 + optional_present as f64) / Self::EXPECTED_FIELDS
    }
}

/// 兑换码（配额记录）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedemptionCode {
    pub id: String,
    pub code: String,
    pub total_uses: i64,
    pub used_count: i64,
    pub daily_limit: i64,
    pub daily_used: i64,
    /// 日配额窗口起点，跨UTC日时滚动清零
    pub daily_reset_at: DateTime<Utc>,
    /// 单次任务允许的最大结果数
    pub single_limit: i64,
    pub status: CodeStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RedemptionCode {
    pub fn new(code: String, total_uses: i64, daily_limit: i64, single_limit: i64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            total_uses,
            used_count: 0,
            daily_limit,
            daily_used: 0,
            daily_reset_at: now,
            single_limit,
            status: CodeStatus::Active,
            expires_at: None,
            created_at: now,
        }
    }

    pub fn remaining_uses(&self) -> i64 {
        (self.total_uses - self.used_count).max(0)
    }

    /// 当日剩余额度，跨日自动视为满额
    pub fn daily_remaining(&self, now: DateTime<Utc>) -> i64 {
        if now.date_naive() > self.daily_reset_at.date_naive() {
            self.daily_limit
        } else {
            (self.daily_limit - self.daily_used).max(0)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodeStatus {
    Active,
    Inactive,
    Expired,
}

impl CodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Active => "active",
            CodeStatus::Inactive => "inactive",
            CodeStatus::Expired => "expired",
        }
    }
}

impl FromStr for CodeStatus {
    type Err = HarvesterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CodeStatus::Active),
            "inactive" => Ok(CodeStatus::Inactive),
            "expired" => Ok(CodeStatus::Expired),
            _ => Err(HarvesterError::Validation(format!("无效的兑换码状态: {s}"))),
        }
    }
}

/// 兑换码校验通过后返回的额度信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeValidation {
    pub code_id: String,
    pub remaining_uses: i64,
    pub daily_remaining: i64,
    pub single_limit: i64,
}
