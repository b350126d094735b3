use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{
    Account, AccountId, AuditEntry, JobId, LedgerOperation, LedgerRepository,
};
use tokio::sync::RwLock;
use tracing::warn;

/// 故障注入计划：在一次提交写入 `after_writes` 行之后失败，生效 `times` 次
#[derive(Debug, Clone, Copy)]
struct FaultPlan {
    after_writes: usize,
    times: u32,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    audit: Vec<AuditEntry>,
    fault: Option<FaultPlan>,
    pending_conflicts: u32,
    commits: u64,
}

/// 内存账本仓储
///
/// 提交逐行写入并记录撤销日志，失败时按撤销日志恢复。整个提交持有写锁，
/// 读者看不到中间状态。
#[derive(Default)]
pub struct InMemoryLedgerRepository {
    state: RwLock<LedgerState>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来 `times` 次提交在写入 `after_writes` 行后失败
    pub async fn inject_failure_after(&self, after_writes: usize, times: u32) {
        self.state.write().await.fault = Some(FaultPlan {
            after_writes,
            times,
        });
    }

    /// 让接下来 `count` 次提交返回写冲突
    pub async fn inject_write_conflicts(&self, count: u32) {
        self.state.write().await.pending_conflicts = count;
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.write().await;
        state.fault = None;
        state.pending_conflicts = 0;
    }

    /// 成功提交次数
    pub async fn commit_count(&self) -> u64 {
        self.state.read().await.commits
    }

    pub async fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.state.read().await.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    fn take_fault(fault: &mut Option<FaultPlan>, written: usize) -> bool {
        match fault {
            Some(plan) if plan.after_writes == written => {
                plan.times = plan.times.saturating_sub(1);
                if plan.times == 0 {
                    *fault = None;
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn open_account(&self, account: &Account) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.id) {
            return Err(OrchestratorError::AccountAlreadyExists {
                id: account.id.to_string(),
            });
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn find_account(&self, id: &AccountId) -> OrchestratorResult<Option<Account>> {
        Ok(self.state.read().await.accounts.get(id).cloned())
    }

    async fn commit(&self, job_id: JobId, operation: &LedgerOperation) -> OrchestratorResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(OrchestratorError::write_conflict("注入的写冲突"));
        }

        for entry in &operation.entries {
            let account = state
                .accounts
                .get(&entry.account_id)
                .ok_or_else(|| OrchestratorError::account_not_found(&entry.account_id))?;
            if account.version != entry.expected_version {
                return Err(OrchestratorError::write_conflict(format!(
                    "账户 {} 版本已变化: 期望 {}, 实际 {}",
                    entry.account_id, entry.expected_version, account.version
                )));
            }
        }

        let now = Utc::now();
        let mut undo: Vec<Account> = Vec::with_capacity(operation.entries.len());
        for (written, entry) in operation.entries.iter().enumerate() {
            if Self::take_fault(&mut state.fault, written) {
                for previous in undo.into_iter().rev() {
                    state.accounts.insert(previous.id.clone(), previous);
                }
                warn!(operation_id = %operation.id, written, "注入故障，账本提交已回滚");
                return Err(OrchestratorError::database_error(format!(
                    "注入故障: 写入 {written} 行后失败"
                )));
            }
            let Some(account) = state.accounts.get_mut(&entry.account_id) else {
                for previous in undo.into_iter().rev() {
                    state.accounts.insert(previous.id.clone(), previous);
                }
                return Err(OrchestratorError::account_not_found(&entry.account_id));
            };
            undo.push(account.clone());
            account.balance = entry.balance_after.clone();
            account.version += 1;
            account.updated_at = now;
        }

        // 审计记录是提交的最后一次写入
        if Self::take_fault(&mut state.fault, operation.entries.len()) {
            for previous in undo.into_iter().rev() {
                state.accounts.insert(previous.id.clone(), previous);
            }
            warn!(operation_id = %operation.id, "注入故障，审计写入失败，账本提交已回滚");
            return Err(OrchestratorError::database_error("注入故障: 审计写入失败"));
        }
        state.audit.push(AuditEntry::new(job_id, operation.clone()));
        state.commits += 1;
        Ok(())
    }

    async fn audit_trail(&self, id: &AccountId) -> OrchestratorResult<Vec<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .audit
            .iter()
            .filter(|entry| entry.touches(id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use orchestrator_domain::{LedgerEntry, LedgerOperationKind};

    async fn seeded() -> InMemoryLedgerRepository {
        let repo = InMemoryLedgerRepository::new();
        repo.open_account(&Account::customer(AccountId::new("a"), "USD", BigDecimal::from(100)))
            .await
            .unwrap();
        repo.open_account(&Account::customer(AccountId::new("b"), "USD", BigDecimal::from(0)))
            .await
            .unwrap();
        repo
    }

    fn transfer(amount: i64) -> LedgerOperation {
        LedgerOperation::new(
            LedgerOperationKind::Transfer,
            "USD",
            vec![
                LedgerEntry {
                    account_id: AccountId::new("a"),
                    delta: BigDecimal::from(-amount),
                    balance_before: BigDecimal::from(100),
                    balance_after: BigDecimal::from(100 - amount),
                    expected_version: 0,
                },
                LedgerEntry {
                    account_id: AccountId::new("b"),
                    delta: BigDecimal::from(amount),
                    balance_before: BigDecimal::from(0),
                    balance_after: BigDecimal::from(amount),
                    expected_version: 0,
                },
            ],
            None,
        )
    }

    #[tokio::test]
    async fn test_commit_applies_all_entries_and_audit() {
        let repo = seeded().await;
        repo.commit(JobId::new(), &transfer(30)).await.unwrap();

        let a = repo.find_account(&AccountId::new("a")).await.unwrap().unwrap();
        let b = repo.find_account(&AccountId::new("b")).await.unwrap().unwrap();
        assert_eq!(a.balance, BigDecimal::from(70));
        assert_eq!(b.balance, BigDecimal::from(30));
        assert_eq!(a.version, 1);
        assert_eq!(repo.audit_trail(&AccountId::new("a")).await.unwrap().len(), 1);
        assert_eq!(repo.audit_trail(&AccountId::new("b")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_rolls_back_partial_writes() {
        let repo = seeded().await;
        repo.inject_failure_after(1, 1).await;

        let result = repo.commit(JobId::new(), &transfer(30)).await;
        assert!(matches!(result, Err(OrchestratorError::Database(_))));

        let a = repo.find_account(&AccountId::new("a")).await.unwrap().unwrap();
        let b = repo.find_account(&AccountId::new("b")).await.unwrap().unwrap();
        assert_eq!(a.balance, BigDecimal::from(100));
        assert_eq!(b.balance, BigDecimal::from(0));
        assert_eq!(a.version, 0);
        assert!(repo.audit_trail(&AccountId::new("a")).await.unwrap().is_empty());

        // 故障只生效一次
        repo.commit(JobId::new(), &transfer(30)).await.unwrap();
        assert_eq!(repo.commit_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_write_conflict() {
        let repo = seeded().await;
        repo.commit(JobId::new(), &transfer(10)).await.unwrap();
        let result = repo.commit(JobId::new(), &transfer(10)).await;
        assert!(matches!(result, Err(OrchestratorError::WriteConflict(_))));
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let repo = seeded().await;
        let result = repo
            .open_account(&Account::customer(AccountId::new("a"), "USD", BigDecimal::from(1)))
            .await;
        assert!(matches!(result, Err(OrchestratorError::AccountAlreadyExists { .. })));
    }
}
