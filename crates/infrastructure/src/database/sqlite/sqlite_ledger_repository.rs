use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{
    Account, AccountId, AuditEntry, JobId, LedgerOperation, LedgerRepository,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::mapping::{format_time, parse_decimal, parse_time, parse_uuid};

/// SQLite账本仓储。一次提交对应一个SQL事务，按版本号做乐观并发控制
pub struct SqliteLedgerRepository {
    pool: SqlitePool,
}

impl SqliteLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_account(row: &SqliteRow) -> OrchestratorResult<Account> {
        let balance: String = row.try_get("balance")?;
        let kind: String = row.try_get("kind")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Account {
            id: AccountId::new(row.try_get::<String, _>("id")?),
            currency: row.try_get("currency")?,
            balance: parse_decimal(&balance)?,
            kind: kind.parse()?,
            version: row.try_get::<i64, _>("version")? as u64,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
        })
    }

    fn row_to_audit(row: &SqliteRow) -> OrchestratorResult<AuditEntry> {
        let id: String = row.try_get("id")?;
        let job_id: String = row.try_get("job_id")?;
        let operation: String = row.try_get("operation")?;
        let recorded_at: String = row.try_get("recorded_at")?;
        Ok(AuditEntry {
            id: parse_uuid(&id)?,
            job_id: JobId::from_uuid(parse_uuid(&job_id)?),
            operation: serde_json::from_str(&operation)?,
            recorded_at: parse_time(&recorded_at)?,
        })
    }
}

#[async_trait]
impl LedgerRepository for SqliteLedgerRepository {
    async fn open_account(&self, account: &Account) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (id, currency, balance, kind, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(account.id.as_str())
        .bind(account.currency.clone())
        .bind(account.balance.to_string())
        .bind(account.kind.as_str())
        .bind(account.version as i64)
        .bind(format_time(&account.created_at))
        .bind(format_time(&account.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::AccountAlreadyExists {
                id: account.id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_account(&self, id: &AccountId) -> OrchestratorResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id, operation_id = %operation.id))]
    async fn commit(&self, job_id: JobId, operation: &LedgerOperation) -> OrchestratorResult<()> {
        let now = format_time(&Utc::now());
        let mut tx = self.pool.begin().await?;

        for entry in &operation.entries {
            let result = sqlx::query(
                r#"
                UPDATE accounts SET balance = ?, version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(entry.balance_after.to_string())
            .bind(now.clone())
            .bind(entry.account_id.as_str())
            .bind(entry.expected_version as i64)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                warn!(account = %entry.account_id, "账户版本已变化，事务回滚");
                return Err(OrchestratorError::write_conflict(format!(
                    "账户 {} 版本已变化或不存在",
                    entry.account_id
                )));
            }
        }

        let accounts: Vec<&str> = operation
            .entries
            .iter()
            .map(|e| e.account_id.as_str())
            .collect();
        let recorded_at = Utc::now();
        let audit_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO ledger_audit (id, job_id, operation_id, kind, accounts, operation,
                recorded_at, recorded_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(audit_id.clone())
        .bind(job_id.to_string())
        .bind(operation.id.to_string())
        .bind(operation.kind.as_str())
        .bind(serde_json::to_string(&accounts)?)
        .bind(serde_json::to_string(operation)?)
        .bind(format_time(&recorded_at))
        .bind(recorded_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for account in &accounts {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO ledger_audit_accounts (audit_id, account_id, recorded_at_ms)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(audit_id.clone())
            .bind(*account)
            .bind(recorded_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(entries = operation.entries.len(), "账本事务已提交");
        Ok(())
    }

    async fn audit_trail(&self, id: &AccountId) -> OrchestratorResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT a.* FROM ledger_audit a
            JOIN ledger_audit_accounts x ON x.audit_id = a.id
            WHERE x.account_id = ?
            ORDER BY x.recorded_at_ms ASC, a.rowid ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_audit).collect()
    }
}
