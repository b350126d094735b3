pub mod sqlite_execution_repository;
pub mod sqlite_ledger_repository;
pub mod sqlite_task_repository;

pub use sqlite_execution_repository::SqliteExecutionRecordRepository;
pub use sqlite_ledger_repository::SqliteLedgerRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

use anyhow::{Context, Result};
use orchestrator_core::config::models::DatabaseConfig;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub type DbPool = Pool<Sqlite>;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("无效的SQLite连接串: {}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存库每个连接各自独立，只能使用单连接
        let max_connections = if in_memory { 1 } else { config.max_connections };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .context("连接SQLite数据库失败")?;

        info!(url = %config.url, max_connections, "SQLite数据库连接已建立");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建表结构
    pub async fn migrate(&self) -> Result<()> {
        debug!("执行SQLite数据库迁移");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                required_worker_type TEXT,
                assigned_worker INTEGER,
                job_id TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建tasks表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_records (
                job_id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                warnings TEXT NOT NULL DEFAULT '[]',
                attempts INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建execution_records表失败")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_records_key ON execution_records (idempotency_key, created_at_ms)",
        )
        .execute(&self.pool)
        .await
        .context("创建execution_records索引失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                currency TEXT NOT NULL,
                balance TEXT NOT NULL,
                kind TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建accounts表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_audit (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                accounts TEXT NOT NULL,
                operation TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                recorded_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建ledger_audit表失败")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_audit_accounts (
                audit_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                recorded_at_ms INTEGER NOT NULL,
                PRIMARY KEY (audit_id, account_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建ledger_audit_accounts表失败")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_audit_accounts_account ON ledger_audit_accounts (account_id, recorded_at_ms)",
        )
        .execute(&self.pool)
        .await
        .context("创建ledger_audit_accounts索引失败")?;

        info!("SQLite数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) mod mapping {
    use chrono::{DateTime, Utc};
    use orchestrator_core::{OrchestratorError, OrchestratorResult};

    pub fn format_time(time: &DateTime<Utc>) -> String {
        time.to_rfc3339()
    }

    pub fn parse_time(value: &str) -> OrchestratorResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| OrchestratorError::Serialization(format!("无效的时间格式 {value}: {e}")))
    }

    pub fn parse_optional_time(value: Option<String>) -> OrchestratorResult<Option<DateTime<Utc>>> {
        value.as_deref().map(parse_time).transpose()
    }

    pub fn parse_uuid(value: &str) -> OrchestratorResult<uuid::Uuid> {
        uuid::Uuid::parse_str(value)
            .map_err(|e| OrchestratorError::Serialization(format!("无效的UUID {value}: {e}")))
    }

    pub fn parse_decimal(value: &str) -> OrchestratorResult<bigdecimal::BigDecimal> {
        use std::str::FromStr;
        bigdecimal::BigDecimal::from_str(value)
            .map_err(|e| OrchestratorError::Serialization(format!("无效的金额 {value}: {e}")))
    }
}
