use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvester_core::{HarvesterError, HarvesterResult};
use harvester_domain::{
    entities::{CodeStatus, CodeValidation, RedemptionCode},
    repositories::UsageRepository,
};
use sqlx::{Row, SqlitePool};

pub struct SqliteUsageRepository {
    pool: SqlitePool,
}

impl SqliteUsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_code(row: &sqlx::sqlite::SqliteRow) -> HarvesterResult<RedemptionCode> {
        let status: String = row.try_get("status")?;

        Ok(RedemptionCode {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            total_uses: row.try_get("total_uses")?,
            used_count: row.try_get("used_count")?,
            daily_limit: row.try_get("daily_limit")?,
            daily_used: row.try_get("daily_used")?,
            daily_reset_at: row.try_get("daily_reset_at")?,
            single_limit: row.try_get("single_limit")?,
            status: status
                .parse()
                .map_err(|e: HarvesterError| HarvesterError::DatabaseOperation(e.to_string()))?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    const SELECT_COLUMNS: &'static str = "id, code, total_uses, used_count, daily_limit, \
         daily_used, daily_reset_at, single_limit, status, expires_at, created_at";
}

/// 对已读出的兑换码执行额度检查，校验逻辑与存储实现无关
pub fn check_quota(
    code: &RedemptionCode,
    now: DateTime<Utc>,
    requested_results: i64,
) -> HarvesterResult<CodeValidation> {
    if code.status != CodeStatus::Active {
        return Err(HarvesterError::QuotaExhausted(format!(
            "兑换码状态为{}",
            code.status.as_str()
        )));
    }
    if let Some(expires_at) = code.expires_at {
        if expires_at < now {
            return Err(HarvesterError::QuotaExhausted("兑换码已过期".to_string()));
        }
    }
    if code.remaining_uses() == 0 {
        return Err(HarvesterError::QuotaExhausted(
            "兑换码总使用次数已耗尽".to_string(),
        ));
    }
    let daily_remaining = code.daily_remaining(now);
    if daily_remaining == 0 {
        return Err(HarvesterError::QuotaExhausted(
            "兑换码今日额度已耗尽".to_string(),
        ));
    }
    if requested_results > code.single_limit {
        return Err(HarvesterError::QuotaExhausted(format!(
            "请求结果数{}超过单次上限{}",
            requested_results, code.single_limit
        )));
    }

    Ok(CodeValidation {
        code_id: code.id.clone(),
        remaining_uses: code.remaining_uses(),
        daily_remaining,
        single_limit: code.single_limit,
    })
}

#[async_trait]
impl UsageRepository for SqliteUsageRepository {
    async fn create(&self, code: &RedemptionCode) -> HarvesterResult<RedemptionCode> {
        sqlx::query(
            r#"
            INSERT INTO redemption_codes
                (id, code, total_uses, used_count, daily_limit, daily_used, daily_reset_at,
                 single_limit, status, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&code.id)
        .bind(&code.code)
        .bind(code.total_uses)
        .bind(code.used_count)
        .bind(code.daily_limit)
        .bind(code.daily_used)
        .bind(code.daily_reset_at)
        .bind(code.single_limit)
        .bind(code.status.as_str())
        .bind(code.expires_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;

        Ok(code.clone())
    }

    async fn find_by_code(&self, code: &str) -> HarvesterResult<Option<RedemptionCode>> {
        let sql = format!(
            "SELECT {} FROM redemption_codes WHERE code = ?",
            Self::SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_code).transpose()
    }

    async fn validate(
        &self,
        code: &str,
        now: DateTime<Utc>,
        requested_results: i64,
    ) -> HarvesterResult<CodeValidation> {
        let Some(record) = self.find_by_code(code).await? else {
            return Err(HarvesterError::CodeNotFound {
                code: code.to_string(),
            });
        };
        check_quota(&record, now, requested_results)
    }

    async fn consume(&self, code_id: &str, now: DateTime<Utc>) -> HarvesterResult<bool> {
        // 单条语句内完成日窗口滚动与计数，并发扣减不会丢失
        let result = sqlx::query(
            r#"
            UPDATE redemption_codes
            SET used_count = used_count + 1,
                daily_used = CASE WHEN date(daily_reset_at) < date(?) THEN 1
                                  ELSE daily_used + 1 END,
                daily_reset_at = CASE WHEN date(daily_reset_at) < date(?) THEN ?
                                      ELSE daily_reset_at END
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(code_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
