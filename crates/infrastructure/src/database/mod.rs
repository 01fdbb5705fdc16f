pub mod sqlite;

use harvester_core::HarvesterResult;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::debug;

/// 创建嵌入式SQLite连接池并完成建表
pub async fn create_sqlite_pool(
    database_url: &str,
    max_connections: u32,
    min_connections: u32,
) -> HarvesterResult<SqlitePool> {
    debug!("创建SQLite连接池: {}", database_url);

    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .connect_with(connect_options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// 运行数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> HarvesterResult<()> {
    debug!("执行SQLite数据库迁移");

    // 任务队列表
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            search_params TEXT NOT NULL DEFAULT '{}',
            max_results INTEGER NOT NULL DEFAULT 50,
            status TEXT NOT NULL DEFAULT 'pending',
            assigned_plugin_id TEXT,
            code_id TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            processed_count INTEGER NOT NULL DEFAULT 0,
            usage_charged INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at DATETIME NOT NULL,
            assigned_at DATETIME,
            started_at DATETIME,
            completed_at DATETIME,
            timeout_at DATETIME,
            FOREIGN KEY (code_id) REFERENCES redemption_codes(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // 插件注册表
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plugin_registry (
            plugin_id TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            capabilities TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'online',
            last_heartbeat DATETIME NOT NULL,
            total_tasks INTEGER NOT NULL DEFAULT 0,
            successful_tasks INTEGER NOT NULL DEFAULT 0,
            performance_score REAL NOT NULL DEFAULT 1.0,
            registered_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // 结果批次表
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            plugin_id TEXT NOT NULL,
            result_data TEXT NOT NULL DEFAULT '[]',
            result_count INTEGER NOT NULL DEFAULT 0,
            quality_score REAL NOT NULL DEFAULT 0,
            winning INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL,
            FOREIGN KEY (task_id) REFERENCES task_queue(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // 兑换码表
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS redemption_codes (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            total_uses INTEGER NOT NULL DEFAULT 0,
            used_count INTEGER NOT NULL DEFAULT 0,
            daily_limit INTEGER NOT NULL DEFAULT 0,
            daily_used INTEGER NOT NULL DEFAULT 0,
            daily_reset_at DATETIME NOT NULL,
            single_limit INTEGER NOT NULL DEFAULT 50,
            status TEXT NOT NULL DEFAULT 'active',
            expires_at DATETIME,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_task_queue_status ON task_queue(status)",
        "CREATE INDEX IF NOT EXISTS idx_task_queue_created_at ON task_queue(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_task_queue_timeout_at ON task_queue(timeout_at)",
        "CREATE INDEX IF NOT EXISTS idx_plugin_registry_status ON plugin_registry(status)",
        "CREATE INDEX IF NOT EXISTS idx_plugin_registry_heartbeat ON plugin_registry(last_heartbeat)",
        "CREATE INDEX IF NOT EXISTS idx_task_results_task_id ON task_results(task_id)",
        "CREATE INDEX IF NOT EXISTS idx_redemption_codes_code ON redemption_codes(code)",
    ];
    for index_sql in indexes {
        sqlx::query(index_sql).execute(pool).await?;
    }

    debug!("SQLite数据库迁移完成");
    Ok(())
}
