use std::sync::Arc;

use chrono::Utc;
use harvester_core::{config::DispatcherConfig, HarvesterResult};
use harvester_domain::repositories::PluginRepository;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 插件存活检测器
///
/// 周期性把心跳超出存活窗口的插件显式标记为offline。
/// 分配资格本身由心跳窗口兜底，这里的标记只是让注册表
/// 的状态字段与实际情况一致。
pub struct PluginLivenessDetector {
    plugin_repo: Arc<dyn PluginRepository>,
    config: DispatcherConfig,
}

impl PluginLivenessDetector {
    pub fn new(plugin_repo: Arc<dyn PluginRepository>, config: DispatcherConfig) -> Self {
        Self {
            plugin_repo,
            config,
        }
    }

    pub async fn run_detection_pass(&self) -> HarvesterResult<u64> {
        let marked = self
            .plugin_repo
            .mark_stale_offline(Utc::now(), self.config.liveness_window_seconds)
            .await?;
        if marked > 0 {
            warn!("{} 个插件心跳超时，已标记为offline", marked);
        }
        Ok(marked)
    }

    pub async fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.liveness_check_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "插件存活检测器启动，检测间隔 {} 秒",
            self.config.liveness_check_interval_seconds
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_detection_pass().await {
                        error!("存活检测出错: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("插件存活检测器收到关闭信号，退出");
                    break;
                }
            }
        }
    }
}
