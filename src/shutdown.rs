use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 各后台组件订阅同一个广播通道，shutdown只会触发一次。
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Mutex<bool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Mutex::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.lock().await;
        if *is_shutdown {
            debug!("关闭已触发过，忽略重复调用");
            return;
        }
        *is_shutdown = true;

        info!(
            "向 {} 个订阅者发送关闭信号",
            self.shutdown_tx.receiver_count()
        );
        // 可能没有存活的接收者
        let _ = self.shutdown_tx.send(());
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
