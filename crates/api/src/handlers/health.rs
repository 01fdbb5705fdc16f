use axum::extract::State;
use serde::Serialize;

use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub connected_plugins: usize,
}

pub async fn health_check(State(state): State<AppState>) -> ApiResponse<HealthStatus> {
    ApiResponse::success(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connected_plugins: state.channels.connected_count().await,
    })
}
