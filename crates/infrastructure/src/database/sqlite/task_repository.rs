use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::{
    entities::{ExtractionTask, TaskStatus},
    repositories::TaskRepository,
};
use sqlx::{Row, SqlitePool};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> HarvesterResult<ExtractionTask> {
        let task_type: String = row.try_get("task_type")?;
        let status: String = row.try_get("status")?;
        let search_params: String = row.try_get("search_params")?;
        let usage_charged: i64 = row.try_get("usage_charged")?;

        Ok(ExtractionTask {
            id: row.try_get("id")?,
            task_type: task_type
                .parse()
                .map_err(|e: HarvesterError| HarvesterError::DatabaseOperation(e.to_string()))?,
            search_params: serde_json::from_str(&search_params)
                .map_err(|e| HarvesterError::Serialization(e.to_string()))?,
            max_results: row.try_get("max_results")?,
            status: status
                .parse()
                .map_err(|e: HarvesterError| HarvesterError::DatabaseOperation(e.to_string()))?,
            assigned_plugin_id: row.try_get("assigned_plugin_id")?,
            code_id: row.try_get("code_id")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            processed_count: row.try_get("processed_count")?,
            usage_charged: usage_charged != 0,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            assigned_at: row.try_get("assigned_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            timeout_at: row.try_get("timeout_at")?,
        })
    }

    const SELECT_COLUMNS: &'static str = "id, task_type, search_params, max_results, status, \
         assigned_plugin_id, code_id, retry_count, max_retries, processed_count, usage_charged, \
         error_message, created_at, assigned_at, started_at, completed_at, timeout_at";
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &ExtractionTask) -> HarvesterResult<ExtractionTask> {
        sqlx::query(
            r#"
            INSERT INTO task_queue
                (id, task_type, search_params, max_results, status, assigned_plugin_id, code_id,
                 retry_count, max_retries, processed_count, usage_charged, error_message,
                 created_at, assigned_at, started_at, completed_at, timeout_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.task_type.as_str())
        .bind(task.search_params.to_string())
        .bind(task.max_results)
        .bind(task.status.as_str())
        .bind(&task.assigned_plugin_id)
        .bind(&task.code_id)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(task.processed_count)
        .bind(task.usage_charged as i64)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.timeout_at)
        .execute(&self.pool)
        .await?;

        Ok(task.clone())
    }

    async fn find_by_id(&self, id: &str) -> HarvesterResult<Option<ExtractionTask>> {
        let sql = format!("SELECT {} FROM task_queue WHERE id = ?", Self::SELECT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_pending(&self, limit: i64) -> HarvesterResult<Vec<ExtractionTask>> {
        let sql = format!(
            "SELECT {} FROM task_queue WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?",
            Self::SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn claim_pending(
        &self,
        id: &str,
        plugin_id: &str,
        timeout_at: DateTime<Utc>,
    ) -> HarvesterResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'assigned', assigned_plugin_id = ?, assigned_at = ?, timeout_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(plugin_id)
        .bind(Utc::now())
        .bind(timeout_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: &str) -> HarvesterResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'pending', assigned_plugin_id = NULL, assigned_at = NULL, timeout_at = NULL
            WHERE id = ? AND status = 'assigned'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(
        &self,
        id: &str,
        plugin_id: &str,
        processed_count: i64,
    ) -> HarvesterResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'processing',
                started_at = COALESCE(started_at, ?),
                processed_count = MIN(?, max_results)
            WHERE id = ? AND assigned_plugin_id = ? AND status IN ('assigned', 'processing')
            "#,
        )
        .bind(Utc::now())
        .bind(processed_count)
        .bind(id)
        .bind(plugin_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finalize(
        &self,
        id: &str,
        plugin_id: &str,
        status: TaskStatus,
        processed_count: i64,
        error_message: Option<&str>,
    ) -> HarvesterResult<bool> {
        if !status.is_terminal() || status == TaskStatus::Cancelled {
            return Err(HarvesterError::Validation(format!(
                "finalize只接受提交终态: {status}"
            )));
        }
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = ?,
                processed_count = MIN(?, max_results),
                error_message = ?,
                completed_at = ?,
                assigned_plugin_id = NULL,
                timeout_at = NULL
            WHERE id = ? AND assigned_plugin_id = ? AND status IN ('assigned', 'processing')
            "#,
        )
        .bind(status.as_str())
        .bind(processed_count)
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .bind(plugin_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> HarvesterResult<Vec<ExtractionTask>> {
        let sql = format!(
            "SELECT {} FROM task_queue \
             WHERE status IN ('assigned', 'processing') AND timeout_at IS NOT NULL AND timeout_at < ? \
             ORDER BY timeout_at ASC",
            Self::SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn reclaim_expired(&self, id: &str, now: DateTime<Utc>) -> HarvesterResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'pending', assigned_plugin_id = NULL, assigned_at = NULL,
                started_at = NULL, timeout_at = NULL, retry_count = retry_count + 1
            WHERE id = ? AND status IN ('assigned', 'processing')
                  AND timeout_at IS NOT NULL AND timeout_at < ?
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_expired(
        &self,
        id: &str,
        now: DateTime<Utc>,
        error_message: &str,
    ) -> HarvesterResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'failed', assigned_plugin_id = NULL, timeout_at = NULL,
                completed_at = ?, error_message = ?
            WHERE id = ? AND status IN ('assigned', 'processing')
                  AND timeout_at IS NOT NULL AND timeout_at < ?
            "#,
        )
        .bind(now)
        .bind(error_message)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel(&self, id: &str) -> HarvesterResult<ExtractionTask> {
        // 更新以读到的快照为条件，认领与取消交错时重读重试，
        // 保证返回的分配信息与被取消的那一刻一致
        loop {
            let Some(task) = self.find_by_id(id).await? else {
                return Err(HarvesterError::TaskNotFound { id: id.to_string() });
            };
            if task.status.is_terminal() {
                return Err(HarvesterError::Conflict(format!(
                    "任务 {id} 已处于终态，无法取消"
                )));
            }

            let completed_at = Utc::now();
            let result = sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'cancelled', assigned_plugin_id = NULL, timeout_at = NULL,
                    completed_at = ?
                WHERE id = ? AND status = ? AND assigned_plugin_id IS ?
                "#,
            )
            .bind(completed_at)
            .bind(id)
            .bind(task.status.as_str())
            .bind(&task.assigned_plugin_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                // 返回取消前的分配信息，状态置为cancelled
                return Ok(ExtractionTask {
                    status: TaskStatus::Cancelled,
                    completed_at: Some(completed_at),
                    ..task
                });
            }
        }
    }

    async fn charge_usage(&self, id: &str) -> HarvesterResult<bool> {
        let result = sqlx::query(
            "UPDATE task_queue SET usage_charged = 1 WHERE id = ? AND usage_charged = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
