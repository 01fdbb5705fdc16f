use axum::{response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 成功响应的统一信封；失败侧的信封由`ApiError`构造
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self::wrap(data, None)
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self::wrap(data, Some(message.into()))
    }

    fn wrap(data: T, message: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message,
            timestamp: Utc::now(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// 列表接口的分页外壳，`total_pages`按`page_size`向上取整
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, page_size: i64) -> Self {
        let total_pages = match page_size {
            n if n > 0 => (total + n - 1) / n,
            _ => 0,
        };
        Self {
            items,
            total,
            page,
            page_size,
            total_pages,
        }
    }
}
