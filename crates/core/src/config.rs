use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub channel: ChannelConfig,
    pub worker: WorkerConfig,
    pub api: ApiConfig,
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 调度循环间隔（秒）
    pub schedule_interval_seconds: u64,
    /// 任务分配后的执行期限（秒）
    pub assignment_timeout_seconds: i64,
    /// 超时重新入队的最大次数，超过后任务置为failed
    pub max_reassign_attempts: i32,
    /// 心跳存活窗口（秒），超过则插件不参与分配
    pub liveness_window_seconds: i64,
    /// 插件失效检测间隔（秒）
    pub liveness_check_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// 推送通道keepalive间隔（秒）
    pub keepalive_interval_seconds: u64,
    /// 单个通道的消息缓冲大小
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub plugin_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub server_url: String,
    pub heartbeat_interval_seconds: u64,
    /// 连续心跳失败超过该值后强制重新注册
    pub heartbeat_failure_threshold: u32,
    /// 进度上报最小间隔（秒）
    pub progress_report_interval_seconds: u64,
    pub reconnect: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// 单次提交允许的最大记录数
    pub max_batch_size: usize,
    /// 单任务结果数上限的硬顶
    pub max_results_cap: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:data/harvester.db".to_string(),
                max_connections: 10,
                min_connections: 1,
                connection_timeout_seconds: 30,
            },
            dispatcher: DispatcherConfig {
                enabled: true,
                schedule_interval_seconds: 5,
                assignment_timeout_seconds: 600, // 10分钟
                max_reassign_attempts: 3,
                liveness_window_seconds: 120, // 心跳间隔的2倍
                liveness_check_interval_seconds: 30,
            },
            channel: ChannelConfig {
                keepalive_interval_seconds: 30,
                buffer_size: 32,
            },
            worker: WorkerConfig {
                enabled: false,
                plugin_id: "plugin-001".to_string(),
                version: "1.0.0".to_string(),
                capabilities: vec!["person-search".to_string()],
                server_url: "http://127.0.0.1:8080".to_string(),
                heartbeat_interval_seconds: 60,
                heartbeat_failure_threshold: 3,
                progress_report_interval_seconds: 5,
                reconnect: RetryConfig {
                    max_attempts: 10,
                    base_delay_ms: 1000,
                    multiplier: 2.0,
                    max_delay_ms: 30000,
                },
            },
            api: ApiConfig {
                enabled: true,
                bind_address: "0.0.0.0:8080".to_string(),
                cors_enabled: true,
            },
            evaluator: EvaluatorConfig {
                max_batch_size: 1000,
                max_results_cap: 1000,
            },
        }
    }
}

impl AppConfig {
    /// 加载配置：默认值 < TOML文件 < HARVESTER__前缀环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        let default_toml =
            toml::to_string(&AppConfig::default()).context("序列化默认配置失败")?;
        builder = builder.add_source(File::from_str(&default_toml, FileFormat::Toml));

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HARVESTER")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("database.url 不能为空");
        }
        if self.dispatcher.schedule_interval_seconds == 0 {
            anyhow::bail!("dispatcher.schedule_interval_seconds 必须大于0");
        }
        if self.dispatcher.assignment_timeout_seconds <= 0 {
            anyhow::bail!("dispatcher.assignment_timeout_seconds 必须大于0");
        }
        if self.dispatcher.max_reassign_attempts < 0 {
            anyhow::bail!("dispatcher.max_reassign_attempts 不能为负数");
        }
        if self.channel.buffer_size == 0 {
            anyhow::bail!("channel.buffer_size 必须大于0");
        }
        if self.worker.enabled {
            if self.worker.plugin_id.is_empty() {
                anyhow::bail!("worker.plugin_id 不能为空");
            }
            if self.worker.capabilities.is_empty() {
                anyhow::bail!("worker.capabilities 不能为空");
            }
        }
        if self.api.enabled && self.api.bind_address.is_empty() {
            anyhow::bail!("api.bind_address 不能为空");
        }
        if self.evaluator.max_batch_size == 0 {
            anyhow::bail!("evaluator.max_batch_size 必须大于0");
        }
        Ok(())
    }
}
