//! HTTP/SSE接口层
//!
//! 插件侧的注册、心跳、推送通道与结果提交接口，
//! 以及调用方的任务管理与兑换码接口。

pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use response::{ApiResponse, PaginatedResponse};
pub use routes::{create_routes, AppState};
