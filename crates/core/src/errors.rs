use thiserror::Error;

/// 系统统一错误类型定义
#[derive(Debug, Error)]
pub enum HarvesterError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("插件未找到: {id}")]
    PluginNotFound { id: String },

    #[error("兑换码未找到: {code}")]
    CodeNotFound { code: String },

    #[error("无效的插件ID: {0}")]
    InvalidPluginId(String),

    #[error("无效的能力标签: {0}")]
    InvalidCapability(String),

    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("结果批次无效: {0}")]
    InvalidBatch(String),

    #[error("任务 {task_id} 不属于插件 {plugin_id}")]
    NotOwner { task_id: String, plugin_id: String },

    #[error("状态竞争失败: {0}")]
    Conflict(String),

    #[error("配额不足: {0}")]
    QuotaExhausted(String),

    #[error("插件 {id} 没有活跃的推送通道")]
    NoActiveChannel { id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl HarvesterError {
    /// 冲突类错误代表调度循环中预期的竞争，调用方应换下一个候选重试
    pub fn is_conflict(&self) -> bool {
        matches!(self, HarvesterError::Conflict(_))
    }
}

/// 统一的Result类型
pub type HarvesterResult<T> = std::result::Result<T, HarvesterError>;
