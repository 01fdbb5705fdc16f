use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::{
    entities::{Capability, Plugin, PluginStatus},
    repositories::PluginRepository,
};
use sqlx::{Row, SqlitePool};

pub struct SqlitePluginRepository {
    pool: SqlitePool,
}

impl SqlitePluginRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_plugin(row: &sqlx::sqlite::SqliteRow) -> HarvesterResult<Plugin> {
        let capabilities: String = row.try_get("capabilities")?;
        let capabilities: Vec<String> = serde_json::from_str(&capabilities)
            .map_err(|e| HarvesterError::Serialization(e.to_string()))?;
        let capabilities = capabilities
            .iter()
            .map(|s| s.parse::<Capability>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HarvesterError::DatabaseOperation(e.to_string()))?;
        let status: String = row.try_get("status")?;

        Ok(Plugin {
            plugin_id: row.try_get("plugin_id")?,
            version: row.try_get("version")?,
            capabilities,
            status: status
                .parse()
                .map_err(|e: HarvesterError| HarvesterError::DatabaseOperation(e.to_string()))?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            total_tasks: row.try_get("total_tasks")?,
            successful_tasks: row.try_get("successful_tasks")?,
            performance_score: row.try_get("performance_score")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    fn capabilities_json(plugin: &Plugin) -> HarvesterResult<String> {
        let tags: Vec<&str> = plugin.capabilities.iter().map(|c| c.as_str()).collect();
        serde_json::to_string(&tags).map_err(|e| HarvesterError::Serialization(e.to_string()))
    }

    const SELECT_COLUMNS: &'static str = "plugin_id, version, capabilities, status, \
         last_heartbeat, total_tasks, successful_tasks, performance_score, registered_at";
}

#[async_trait]
impl PluginRepository for SqlitePluginRepository {
    async fn upsert(&self, plugin: &Plugin) -> HarvesterResult<bool> {
        let capabilities = Self::capabilities_json(plugin)?;
        // 已注册则刷新声明信息并回到online，生涯统计保持不变
        let updated = sqlx::query(
            r#"
            UPDATE plugin_registry
            SET version = ?, capabilities = ?, status = 'online', last_heartbeat = ?
            WHERE plugin_id = ?
            "#,
        )
        .bind(&plugin.version)
        .bind(&capabilities)
        .bind(Utc::now())
        .bind(&plugin.plugin_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO plugin_registry
                (plugin_id, version, capabilities, status, last_heartbeat,
                 total_tasks, successful_tasks, performance_score, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&plugin.plugin_id)
        .bind(&plugin.version)
        .bind(&capabilities)
        .bind(plugin.status.as_str())
        .bind(plugin.last_heartbeat)
        .bind(plugin.total_tasks)
        .bind(plugin.successful_tasks)
        .bind(plugin.performance_score)
        .bind(plugin.registered_at)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn find_by_id(&self, id: &str) -> HarvesterResult<Option<Plugin>> {
        let sql = format!(
            "SELECT {} FROM plugin_registry WHERE plugin_id = ?",
            Self::SELECT_COLUMNS
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_plugin).transpose()
    }

    async fn heartbeat(
        &self,
        id: &str,
        status: PluginStatus,
        now: DateTime<Utc>,
    ) -> HarvesterResult<bool> {
        let result = sqlx::query(
            "UPDATE plugin_registry SET last_heartbeat = ?, status = ? WHERE plugin_id = ?",
        )
        .bind(now)
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_eligible(
        &self,
        capability: Capability,
        now: DateTime<Utc>,
        liveness_window_seconds: i64,
    ) -> HarvesterResult<Vec<Plugin>> {
        let cutoff = now - Duration::seconds(liveness_window_seconds);
        let sql = format!(
            "SELECT {} FROM plugin_registry \
             WHERE status = 'online' AND last_heartbeat >= ? \
             ORDER BY performance_score DESC, last_heartbeat DESC",
            Self::SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;

        // 能力标签存储为JSON数组，在内存中过滤
        let plugins = rows
            .iter()
            .map(Self::row_to_plugin)
            .collect::<HarvesterResult<Vec<_>>>()?;
        Ok(plugins
            .into_iter()
            .filter(|p| p.supports(capability))
            .collect())
    }

    async fn set_status(&self, id: &str, status: PluginStatus) -> HarvesterResult<bool> {
        let result = sqlx::query("UPDATE plugin_registry SET status = ? WHERE plugin_id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_task_result(
        &self,
        id: &str,
        success: bool,
        alpha: f64,
    ) -> HarvesterResult<bool> {
        let outcome = if success { 1.0 } else { 0.0 };
        let result = sqlx::query(
            r#"
            UPDATE plugin_registry
            SET total_tasks = total_tasks + 1,
                successful_tasks = successful_tasks + ?,
                performance_score = performance_score * ? + ?
            WHERE plugin_id = ?
            "#,
        )
        .bind(success as i64)
        .bind(1.0 - alpha)
        .bind(alpha * outcome)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_stale_offline(
        &self,
        now: DateTime<Utc>,
        liveness_window_seconds: i64,
    ) -> HarvesterResult<u64> {
        let cutoff = now - Duration::seconds(liveness_window_seconds);
        let result = sqlx::query(
            "UPDATE plugin_registry SET status = 'offline' \
             WHERE status != 'offline' AND last_heartbeat < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
