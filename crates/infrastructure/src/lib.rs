//! 基础设施层
//!
//! 提供仓储的SQLite实现、嵌入式内存实现以及插件推送通道。

pub mod channel;
pub mod database;
pub mod in_memory;

pub use channel::PushChannelManager;
pub use database::sqlite::{
    SqlitePluginRepository, SqliteResultRepository, SqliteTaskRepository, SqliteUsageRepository,
};
pub use database::{create_sqlite_pool, run_migrations};
pub use in_memory::{
    InMemoryPluginRepository, InMemoryResultRepository, InMemoryTaskRepository,
    InMemoryUsageRepository,
};
