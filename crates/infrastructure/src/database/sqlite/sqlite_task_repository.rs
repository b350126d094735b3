use async_trait::async_trait;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{Task, TaskId, TaskRepository, TaskStatus, WorkerId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::mapping::{format_time, parse_optional_time, parse_time, parse_uuid};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> OrchestratorResult<Task> {
        let id: String = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        let kind: String = row.try_get("kind")?;
        let priority: String = row.try_get("priority")?;
        let status: String = row.try_get("status")?;
        let job_id: Option<String> = row.try_get("job_id")?;
        let assigned_worker: Option<i64> = row.try_get("assigned_worker")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Task {
            id: TaskId::from_uuid(parse_uuid(&id)?),
            kind: kind.parse()?,
            payload: serde_json::from_str(&payload)?,
            priority: priority.parse()?,
            sequence: row.try_get::<i64, _>("sequence")? as u64,
            status: status.parse()?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            required_worker_type: row.try_get("required_worker_type")?,
            assigned_worker: assigned_worker.map(|w| WorkerId::new(w as u64)),
            job_id: job_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(orchestrator_domain::JobId::from_uuid),
            last_error: row.try_get("last_error")?,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            started_at: parse_optional_time(row.try_get("started_at")?)?,
            completed_at: parse_optional_time(row.try_get("completed_at")?)?,
        })
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn create(&self, task: &Task) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, payload, priority, sequence, status, retry_count,
                max_retries, required_worker_type, assigned_worker, job_id, last_error,
                created_at, updated_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.kind.as_str())
        .bind(serde_json::to_string(&task.payload)?)
        .bind(task.priority.as_str())
        .bind(task.sequence as i64)
        .bind(task.status.as_str())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.required_worker_type.clone())
        .bind(task.assigned_worker.map(|w| w.value() as i64))
        .bind(task.job_id.map(|j| j.to_string()))
        .bind(task.last_error.clone())
        .bind(format_time(&task.created_at))
        .bind(format_time(&task.updated_at))
        .bind(task.started_at.as_ref().map(format_time))
        .bind(task.completed_at.as_ref().map(format_time))
        .execute(&self.pool)
        .await?;

        debug!("任务已写入SQLite");
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status))]
    async fn update(&self, task: &Task) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = ?, retry_count = ?, assigned_worker = ?, job_id = ?,
                last_error = ?, updated_at = ?, started_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.retry_count))
        .bind(task.assigned_worker.map(|w| w.value() as i64))
        .bind(task.job_id.map(|j| j.to_string()))
        .bind(task.last_error.clone())
        .bind(format_time(&task.updated_at))
        .bind(task.started_at.as_ref().map(format_time))
        .bind(task.completed_at.as_ref().map(format_time))
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::task_not_found(task.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> OrchestratorResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_by_status(&self, status: TaskStatus) -> OrchestratorResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY sequence ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }
}
