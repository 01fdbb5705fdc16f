//! 插件（Worker）端
//!
//! 生产环境的提取执行器是浏览器扩展；这个crate实现同样的
//! 控制协议（注册、心跳、SSE通道、进度与结果提交），
//! 供本地联调和端到端测试使用。

pub mod agent;
pub mod api_client;
pub mod executor;

pub use agent::PluginAgent;
pub use api_client::{HarvesterClient, TaskStream};
pub use executor::{ExtractionExecutor, ExtractionOutcome, SimulatedExecutor};
