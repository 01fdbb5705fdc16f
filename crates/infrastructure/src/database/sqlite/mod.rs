mod plugin_repository;
mod result_repository;
mod task_repository;
mod usage_repository;

pub use plugin_repository::SqlitePluginRepository;
pub use result_repository::SqliteResultRepository;
pub use task_repository::SqliteTaskRepository;
pub use usage_repository::{check_quota, SqliteUsageRepository};
