use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;

use crate::entities::{Task, TaskStatus};
use crate::execution::{ClaimOutcome, ExecutionRecord};
use crate::ledger::{Account, AuditEntry, LedgerOperation};
use crate::payload::TaskKind;
use crate::value_objects::{AccountId, JobId, TaskId};

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> OrchestratorResult<()>;
    async fn update(&self, task: &Task) -> OrchestratorResult<()>;
    async fn find_by_id(&self, id: TaskId) -> OrchestratorResult<Option<Task>>;
    async fn find_by_status(&self, status: TaskStatus) -> OrchestratorResult<Vec<Task>>;
}

/// 执行记录仓储
#[async_trait]
pub trait ExecutionRecordRepository: Send + Sync {
    /// 原子认领：若 `since` 之后存在同键的进行中/已成功记录则返回它，否则写入 `record`
    async fn claim(
        &self,
        record: &ExecutionRecord,
        since: DateTime<Utc>,
    ) -> OrchestratorResult<ClaimOutcome>;
    async fn update(&self, record: &ExecutionRecord) -> OrchestratorResult<()>;
    async fn find_by_job_id(&self, job_id: JobId) -> OrchestratorResult<Option<ExecutionRecord>>;
    /// 最近的同类记录，按创建时间倒序
    async fn recent_by_kind(
        &self,
        kind: TaskKind,
        limit: usize,
    ) -> OrchestratorResult<Vec<ExecutionRecord>>;
}

/// 账本仓储
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn open_account(&self, account: &Account) -> OrchestratorResult<()>;
    async fn find_account(&self, id: &AccountId) -> OrchestratorResult<Option<Account>>;
    /// 全有或全无地提交一次操作：校验每个账户的期望版本，写入新余额并追加审计记录。
    /// 版本不一致返回 `WriteConflict`，任何失败都不留下部分写入
    async fn commit(&self, job_id: JobId, operation: &LedgerOperation) -> OrchestratorResult<()>;
    async fn audit_trail(&self, id: &AccountId) -> OrchestratorResult<Vec<AuditEntry>>;
}
