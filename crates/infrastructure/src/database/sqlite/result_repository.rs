use async_trait::async_trait;
use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::{entities::ResultBatch, repositories::ResultRepository};
use sqlx::{Row, SqlitePool};

pub struct SqliteResultRepository {
    pool: SqlitePool,
}

impl SqliteResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> HarvesterResult<ResultBatch> {
        let result_data: String = row.try_get("result_data")?;
        let winning: i64 = row.try_get("winning")?;

        Ok(ResultBatch {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            plugin_id: row.try_get("plugin_id")?,
            result_data: serde_json::from_str(&result_data)
                .map_err(|e| HarvesterError::Serialization(e.to_string()))?,
            result_count: row.try_get("result_count")?,
            quality_score: row.try_get("quality_score")?,
            winning: winning != 0,
            created_at: row.try_get("created_at")?,
        })
    }

    const SELECT_COLUMNS: &'static str =
        "id, task_id, plugin_id, result_data, result_count, quality_score, winning, created_at";
}

#[async_trait]
impl ResultRepository for SqliteResultRepository {
    async fn save(&self, batch: &ResultBatch) -> HarvesterResult<ResultBatch> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_results
                (task_id, plugin_id, result_data, result_count, quality_score, winning, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.task_id)
        .bind(&batch.plugin_id)
        .bind(batch.result_data.to_string())
        .bind(batch.result_count)
        .bind(batch.quality_score)
        .bind(batch.winning as i64)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await?;

        Ok(ResultBatch {
            id: result.last_insert_rowid(),
            ..batch.clone()
        })
    }

    async fn find_by_task(&self, task_id: &str) -> HarvesterResult<Vec<ResultBatch>> {
        let sql = format!(
            "SELECT {} FROM task_results WHERE task_id = ? ORDER BY created_at ASC",
            Self::SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(task_id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_batch).collect()
    }

    async fn find_winning(&self, task_id: &str) -> HarvesterResult<Option<ResultBatch>> {
        let sql = format!(
            "SELECT {} FROM task_results WHERE task_id = ? AND winning = 1 \
             ORDER BY created_at ASC LIMIT 1",
            Self::SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_batch).transpose()
    }
}
