use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::messages::PushMessage;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// 服务端HTTP客户端
///
/// 封装插件侧的全部接口：注册、心跳、SSE推送通道、进度上报和结果提交。
pub struct HarvesterClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    plugin_id: &'a str,
    version: &'a str,
    capabilities: &'a [String],
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub plugin_id: String,
    pub is_update: bool,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    plugin_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_task_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ProgressRequest<'a> {
    task_id: &'a str,
    plugin_id: &'a str,
    processed_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub aggregate_quality: f64,
}

impl HarvesterClient {
    pub fn new(base_url: &str) -> HarvesterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HarvesterError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn register(
        &self,
        plugin_id: &str,
        version: &str,
        capabilities: &[String],
    ) -> HarvesterResult<RegisterResponse> {
        self.post_json(
            "/api/plugins/register",
            &RegisterRequest {
                plugin_id,
                version,
                capabilities,
            },
        )
        .await
    }

    pub async fn heartbeat(
        &self,
        plugin_id: &str,
        status: &str,
        current_task_id: Option<&str>,
    ) -> HarvesterResult<()> {
        let _: Value = self
            .post_json(
                "/api/plugins/heartbeat",
                &HeartbeatRequest {
                    plugin_id,
                    status,
                    current_task_id,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn report_progress(
        &self,
        task_id: &str,
        plugin_id: &str,
        processed_count: i64,
    ) -> HarvesterResult<()> {
        let _: Value = self
            .post_json(
                "/api/plugins/progress",
                &ProgressRequest {
                    task_id,
                    plugin_id,
                    processed_count,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn submit(&self, submission: &Value) -> HarvesterResult<SubmitResponse> {
        self.post_json("/api/plugins/submit", submission).await
    }

    /// 打开SSE推送通道
    pub async fn open_stream(&self, plugin_id: &str) -> HarvesterResult<TaskStream> {
        let url = format!(
            "{}/api/plugins/tasks/stream?plugin_id={}",
            self.base_url, plugin_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HarvesterError::Network(format!("建立推送通道失败: {e}")))?;
        if !response.status().is_success() {
            return Err(HarvesterError::Network(format!(
                "建立推送通道失败: HTTP {}",
                response.status()
            )));
        }
        Ok(TaskStream {
            inner: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        })
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> HarvesterResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| HarvesterError::Network(format!("请求 {path} 失败: {e}")))?;

        let status = response.status();
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| HarvesterError::Network(format!("解析 {path} 响应失败: {e}")))?;

        if !status.is_success() {
            let message = envelope["error"]["message"]
                .as_str()
                .unwrap_or("未知错误")
                .to_string();
            return Err(HarvesterError::Network(format!(
                "{path} 返回 HTTP {status}: {message}"
            )));
        }

        serde_json::from_value(envelope["data"].clone())
            .map_err(|e| HarvesterError::Serialization(e.to_string()))
    }
}

/// SSE事件流
///
/// 按空行切分事件帧，拼接data行后反序列化为推送消息。
/// 无法识别的帧（注释、心跳填充）直接跳过。
pub struct TaskStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
}

impl TaskStream {
    /// 下一条推送消息；通道被服务端关闭时返回None
    pub async fn next_message(&mut self) -> HarvesterResult<Option<PushMessage>> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let frame = self.buffer[..pos].to_string();
                self.buffer.drain(..pos + 2);
                if let Some(message) = Self::parse_frame(&frame) {
                    return Ok(Some(message));
                }
                continue;
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => {
                    return Err(HarvesterError::Network(format!("推送通道读取失败: {e}")));
                }
                None => {
                    debug!("推送通道已被服务端关闭");
                    return Ok(None);
                }
            }
        }
    }

    fn parse_frame(frame: &str) -> Option<PushMessage> {
        let data: String = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect::<Vec<_>>()
            .join("\n");
        if data.is_empty() {
            return None;
        }
        match serde_json::from_str(&data) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("忽略无法解析的推送帧: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_task_assignment() {
        let frame = r#"data: {"type":"task-assignment","task_id":"t1","task_type":"person-search","search_params":{},"max_results":10,"timeout_at":"2026-01-01T00:00:00Z","timestamp":"2026-01-01T00:00:00Z"}"#;
        match TaskStream::parse_frame(frame) {
            Some(PushMessage::TaskAssignment {
                task_id,
                max_results,
                ..
            }) => {
                assert_eq!(task_id, "t1");
                assert_eq!(max_results, 10);
            }
            other => panic!("解析结果不符: {other:?}"),
        }
    }

    #[test]
    fn test_parse_frame_skips_comments_and_garbage() {
        assert!(TaskStream::parse_frame(": keepalive-comment").is_none());
        assert!(TaskStream::parse_frame("data: not-json").is_none());
        assert!(TaskStream::parse_frame("").is_none());
    }

    #[test]
    fn test_parse_frame_keepalive() {
        let frame = r#"data: {"type":"keepalive","connected_plugins":3,"timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(
            TaskStream::parse_frame(frame),
            Some(PushMessage::Keepalive {
                connected_plugins: 3,
                ..
            })
        ));
    }
}
