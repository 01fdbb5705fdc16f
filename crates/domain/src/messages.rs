use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::Capability;

/// 推送通道上的服务端→插件消息
///
/// 以`type`字段区分，SSE数据帧内是完整的JSON对象。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushMessage {
    /// 通道建立后立即下发的确认
    ConnectionAck {
        plugin_id: String,
        server_version: String,
        timestamp: DateTime<Utc>,
    },
    /// 周期性存活探测，防止中间层静默断开空闲连接
    Keepalive {
        connected_plugins: usize,
        timestamp: DateTime<Utc>,
    },
    /// 任务分配通知
    TaskAssignment {
        task_id: String,
        task_type: Capability,
        search_params: serde_json::Value,
        max_results: i64,
        timeout_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl PushMessage {
    pub fn connection_ack(plugin_id: &str, server_version: &str) -> Self {
        PushMessage::ConnectionAck {
            plugin_id: plugin_id.to_string(),
            server_version: server_version.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn keepalive(connected_plugins: usize) -> Self {
        PushMessage::Keepalive {
            connected_plugins,
            timestamp: Utc::now(),
        }
    }

    pub fn task_assignment(
        task_id: &str,
        task_type: Capability,
        search_params: serde_json::Value,
        max_results: i64,
        timeout_at: DateTime<Utc>,
    ) -> Self {
        PushMessage::TaskAssignment {
            task_id: task_id.to_string(),
            task_type,
            search_params,
            max_results,
            timeout_at,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_type_names() {
        let ack = PushMessage::connection_ack("plugin-1", "1.0.0");
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["type"], "connection-ack");
        assert_eq!(value["plugin_id"], "plugin-1");

        let keepalive = PushMessage::keepalive(3);
        let value = serde_json::to_value(&keepalive).unwrap();
        assert_eq!(value["type"], "keepalive");
        assert_eq!(value["connected_plugins"], 3);

        let assignment = PushMessage::task_assignment(
            "task-1",
            Capability::PersonSearch,
            json!({"keywords": "rust"}),
            50,
            Utc::now(),
        );
        let value = serde_json::to_value(&assignment).unwrap();
        assert_eq!(value["type"], "task-assignment");
        assert_eq!(value["task_type"], "person-search");
        assert_eq!(value["max_results"], 50);
    }

    #[test]
    fn test_roundtrip() {
        let assignment = PushMessage::task_assignment(
            "task-1",
            Capability::CompanySearch,
            json!({"company": "Acme"}),
            10,
            Utc::now(),
        );
        let text = serde_json::to_string(&assignment).unwrap();
        let parsed: PushMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, assignment);
    }
}
