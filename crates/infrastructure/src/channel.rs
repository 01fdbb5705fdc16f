use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::PushMessage;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 推送通道管理器
///
/// 维护插件ID到出站通道的映射，是系统中唯一的纯内存共享资源。
/// 所有持久状态都在任务队列和插件注册表中，通道丢失只意味着
/// 失去一条投递路径，不影响任务状态。
///
/// 映射表由RwLock守护并通过Arc显式传递给需要发送的组件，
/// 不做全局可变状态。
pub struct PushChannelManager {
    channels: RwLock<HashMap<String, mpsc::Sender<PushMessage>>>,
    buffer_size: usize,
}

impl PushChannelManager {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            buffer_size,
        }
    }

    /// 为插件建立推送通道，返回接收端（由SSE处理器消费）。
    /// 同一插件重复打开会替换旧通道，旧接收端随之关闭。
    /// 注册校验由API层在调用前完成。
    pub async fn open(&self, plugin_id: &str, server_version: &str) -> mpsc::Receiver<PushMessage> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        // 通道建立后立即排入connection-ack
        let _ = tx.try_send(PushMessage::connection_ack(plugin_id, server_version));

        let mut channels = self.channels.write().await;
        if channels.insert(plugin_id.to_string(), tx).is_some() {
            debug!("插件 {} 的旧推送通道已被替换", plugin_id);
        }
        info!("插件 {} 建立推送通道", plugin_id);
        rx
    }

    /// 尽力投递：通道不存在或已断开时返回NoActiveChannel，
    /// 调用方（调度器）不得视为已送达。不会阻塞在慢速消费者上。
    pub async fn send(&self, plugin_id: &str, message: PushMessage) -> HarvesterResult<()> {
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(plugin_id) else {
            return Err(HarvesterError::NoActiveChannel {
                id: plugin_id.to_string(),
            });
        };
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_))
            | Err(mpsc::error::TrySendError::Full(_)) => {
                drop(channels);
                // 已断开或积压的通道视同不存在
                self.close(plugin_id).await;
                Err(HarvesterError::NoActiveChannel {
                    id: plugin_id.to_string(),
                })
            }
        }
    }

    /// 注销通道。重复关闭是安全的空操作。
    pub async fn close(&self, plugin_id: &str) {
        let mut channels = self.channels.write().await;
        if channels.remove(plugin_id).is_some() {
            info!("插件 {} 断开推送通道", plugin_id);
        }
    }

    pub async fn is_connected(&self, plugin_id: &str) -> bool {
        self.channels.read().await.contains_key(plugin_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// 向所有打开的通道发送keepalive，同时清理已断开的条目。
    /// 返回仍然存活的通道数。
    pub async fn broadcast_keepalive(&self) -> usize {
        let snapshot: Vec<String> = {
            let channels = self.channels.read().await;
            channels.keys().cloned().collect()
        };
        let total = snapshot.len();

        for plugin_id in snapshot {
            let message = PushMessage::keepalive(total);
            if let Err(e) = self.send(&plugin_id, message).await {
                warn!("向插件 {} 发送keepalive失败: {}", plugin_id, e);
            }
        }
        self.channels.read().await.len()
    }

    /// 启动周期性keepalive循环，独立于业务消息，
    /// 防止中间层超时静默断开空闲连接。
    pub fn start_keepalive_loop(
        self: &Arc<Self>,
        interval_seconds: u64,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_seconds));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let alive = manager.broadcast_keepalive().await;
                        debug!("keepalive已发送，存活通道数: {}", alive);
                    }
                    _ = shutdown_rx.recv() => {
                        info!("keepalive循环收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_queues_connection_ack() {
        let manager = PushChannelManager::new(8);
        let mut rx = manager.open("plugin-1", "1.0.0").await;

        let first = rx.recv().await.unwrap();
        match first {
            PushMessage::ConnectionAck { plugin_id, .. } => assert_eq!(plugin_id, "plugin-1"),
            other => panic!("期望connection-ack，得到 {other:?}"),
        }
        assert!(manager.is_connected("plugin-1").await);
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let manager = PushChannelManager::new(8);
        let result = manager.send("ghost", PushMessage::keepalive(0)).await;
        assert!(matches!(
            result,
            Err(HarvesterError::NoActiveChannel { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_prunes_channel() {
        let manager = PushChannelManager::new(8);
        let rx = manager.open("plugin-1", "1.0.0").await;
        drop(rx);

        let result = manager.send("plugin-1", PushMessage::keepalive(1)).await;
        assert!(matches!(
            result,
            Err(HarvesterError::NoActiveChannel { .. })
        ));
        assert!(!manager.is_connected("plugin-1").await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = PushChannelManager::new(8);
        let _rx = manager.open("plugin-1", "1.0.0").await;
        manager.close("plugin-1").await;
        manager.close("plugin-1").await;
        assert_eq!(manager.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_reopen_replaces_channel() {
        let manager = PushChannelManager::new(8);
        let mut rx1 = manager.open("plugin-1", "1.0.0").await;
        let _ack = rx1.recv().await.unwrap();
        let mut rx2 = manager.open("plugin-1", "1.0.0").await;
        let _ack = rx2.recv().await.unwrap();
        assert_eq!(manager.connected_count().await, 1);

        manager
            .send("plugin-1", PushMessage::keepalive(1))
            .await
            .unwrap();
        // 消息走新通道
        assert!(matches!(
            rx2.recv().await.unwrap(),
            PushMessage::Keepalive { .. }
        ));
        // 旧通道已关闭
        assert!(rx1.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_keepalive_counts_alive() {
        let manager = PushChannelManager::new(8);
        let mut rx1 = manager.open("plugin-1", "1.0.0").await;
        let rx2 = manager.open("plugin-2", "1.0.0").await;
        drop(rx2);

        let alive = manager.broadcast_keepalive().await;
        assert_eq!(alive, 1);

        let _ack = rx1.recv().await.unwrap();
        assert!(matches!(
            rx1.recv().await.unwrap(),
            PushMessage::Keepalive { .. }
        ));
    }
}
