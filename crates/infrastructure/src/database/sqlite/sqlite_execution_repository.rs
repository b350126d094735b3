use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::{
    ClaimOutcome, ExecutionRecord, ExecutionRecordRepository, JobId, TaskKind,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::mapping::{format_time, parse_optional_time, parse_time, parse_uuid};

pub struct SqliteExecutionRecordRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> OrchestratorResult<ExecutionRecord> {
        let job_id: String = row.try_get("job_id")?;
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let warnings: String = row.try_get("warnings")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(ExecutionRecord {
            job_id: JobId::from_uuid(parse_uuid(&job_id)?),
            idempotency_key: row.try_get("idempotency_key")?,
            kind: kind.parse()?,
            status: status.parse()?,
            result: result.as_deref().map(serde_json::from_str).transpose()?,
            error: row.try_get("error")?,
            warnings: serde_json::from_str(&warnings)?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
            created_at: parse_time(&created_at)?,
            completed_at: parse_optional_time(row.try_get("completed_at")?)?,
        })
    }

    async fn insert<'e, E>(executor: E, record: &ExecutionRecord) -> OrchestratorResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO execution_records (job_id, idempotency_key, kind, status, result, error,
                warnings, attempts, duration_ms, created_at, created_at_ms, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(record.idempotency_key.clone())
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.result.as_ref().map(|r| r.to_string()))
        .bind(record.error.clone())
        .bind(serde_json::to_string(&record.warnings)?)
        .bind(i64::from(record.attempts))
        .bind(record.duration_ms as i64)
        .bind(format_time(&record.created_at))
        .bind(record.created_at.timestamp_millis())
        .bind(record.completed_at.as_ref().map(format_time))
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionRecordRepository for SqliteExecutionRecordRepository {
    #[instrument(skip(self, record), fields(job_id = %record.job_id))]
    async fn claim(
        &self,
        record: &ExecutionRecord,
        since: DateTime<Utc>,
    ) -> OrchestratorResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT * FROM execution_records
            WHERE idempotency_key = ? AND created_at_ms >= ?
              AND status IN ('IN_PROGRESS', 'SUCCEEDED')
            ORDER BY created_at_ms DESC
            LIMIT 1
            "#,
        )
        .bind(record.idempotency_key.clone())
        .bind(since.timestamp_millis())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let existing = Self::row_to_record(&row)?;
            tx.commit().await?;
            debug!(existing_job = %existing.job_id, "命中已有执行记录");
            return Ok(ClaimOutcome::Existing(existing));
        }

        Self::insert(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn update(&self, record: &ExecutionRecord) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE execution_records SET status = ?, result = ?, error = ?, warnings = ?,
                attempts = ?, duration_ms = ?, completed_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.result.as_ref().map(|r| r.to_string()))
        .bind(record.error.clone())
        .bind(serde_json::to_string(&record.warnings)?)
        .bind(i64::from(record.attempts))
        .bind(record.duration_ms as i64)
        .bind(record.completed_at.as_ref().map(format_time))
        .bind(record.job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Self::insert(&self.pool, record).await?;
        }
        Ok(())
    }

    async fn find_by_job_id(&self, job_id: JobId) -> OrchestratorResult<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM execution_records WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn recent_by_kind(
        &self,
        kind: TaskKind,
        limit: usize,
    ) -> OrchestratorResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records WHERE kind = ? ORDER BY created_at_ms DESC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }
}
