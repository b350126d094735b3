//! 账本服务
//!
//! 每次操作在持有所有相关账户锁的情况下读取余额、计算新余额并通过仓储一次性提交。
//! 账户锁按账户ID排序后依次获取，多账户操作之间不会死锁。每次操作都记入一个
//! 系统对手方账户（扣款记入清算账户，调整记入调整账户），所有操作的变动之和恒为零。

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::{BigDecimal, Signed};
use orchestrator_core::{LedgerConfig, OrchestratorError, OrchestratorResult};
use orchestrator_domain::{
    Account, AccountId, AdjustmentRequest, AuditEntry, DebitRequest, EventSink, JobId,
    LedgerEntry, LedgerOperation, LedgerOperationKind, LedgerRepository, LifecycleEvent,
    Precision, TaskPayload, TransferRequest,
};
use orchestrator_infrastructure::MetricsCollector;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

pub struct LedgerService {
    repository: Arc<dyn LedgerRepository>,
    config: LedgerConfig,
    precision: Precision,
    locks: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
    events: Arc<dyn EventSink>,
    metrics: MetricsCollector,
}

impl LedgerService {
    pub fn new(
        repository: Arc<dyn LedgerRepository>,
        config: LedgerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let precision = Precision::new(config.decimal_places);
        Self {
            repository,
            config,
            precision,
            locks: Mutex::new(HashMap::new()),
            events,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn clearing_account(&self, currency: &str) -> AccountId {
        AccountId::new(format!(
            "{}:{}",
            self.config.clearing_account_prefix,
            currency.to_uppercase()
        ))
    }

    pub fn adjustment_account(&self, currency: &str) -> AccountId {
        AccountId::new(format!(
            "{}:{}",
            self.config.adjustment_account_prefix,
            currency.to_uppercase()
        ))
    }

    /// 开立客户账户，期初余额按精度舍入且不得为负
    pub async fn open_account(
        &self,
        id: AccountId,
        currency: &str,
        opening_balance: BigDecimal,
    ) -> OrchestratorResult<Account> {
        if opening_balance.is_negative() {
            return Err(OrchestratorError::invalid_params(format!(
                "账户 {id} 期初余额不能为负"
            )));
        }
        if self.is_system_id(&id) {
            return Err(OrchestratorError::invalid_params(format!(
                "账户 {id} 使用了系统账户前缀"
            )));
        }
        let account = Account::customer(id, currency, self.precision.round(&opening_balance));
        self.repository.open_account(&account).await?;
        info!(account = %account.id, currency = %account.currency, "账户已开立");
        Ok(account)
    }

    pub async fn account(&self, id: &AccountId) -> OrchestratorResult<Account> {
        self.repository
            .find_account(id)
            .await?
            .ok_or_else(|| OrchestratorError::account_not_found(id))
    }

    pub async fn balance(&self, id: &AccountId) -> OrchestratorResult<BigDecimal> {
        Ok(self.account(id).await?.balance)
    }

    pub async fn audit_trail(&self, id: &AccountId) -> OrchestratorResult<Vec<AuditEntry>> {
        self.repository.audit_trail(id).await
    }

    /// 执行负载对应的账本操作。负载应已按精度规范化
    pub async fn apply(
        &self,
        job_id: JobId,
        payload: &TaskPayload,
    ) -> OrchestratorResult<LedgerOperation> {
        match payload {
            TaskPayload::PaymentProcessing(request) => self.debit(job_id, request).await,
            TaskPayload::BalanceTransfer(request) => self.transfer(job_id, request).await,
            TaskPayload::BalanceAdjustment(request) => self.adjust(job_id, request).await,
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, account = %request.account_id))]
    pub async fn debit(
        &self,
        job_id: JobId,
        request: &DebitRequest,
    ) -> OrchestratorResult<LedgerOperation> {
        let amount = self.positive_amount(&request.amount)?;
        let clearing_id = self.clearing_account(&request.currency);
        let _guards = self
            .lock_accounts(&[request.account_id.clone(), clearing_id.clone()])
            .await;

        let account = self
            .load_customer(&request.account_id, &request.currency)
            .await?;
        ensure_sufficient(&account, &amount)?;
        let clearing = self.load_system(&clearing_id, &request.currency).await?;

        let operation = LedgerOperation::new(
            LedgerOperationKind::Debit,
            &account.currency,
            vec![
                self.entry(&account, -amount.clone()),
                self.entry(&clearing, amount),
            ],
            request.reference.clone(),
        );
        self.commit(job_id, operation).await
    }

    /// 转账：借贷两方写在同一个操作和同一条审计记录中
    #[instrument(skip_all, fields(job_id = %job_id, from = %request.from_account, to = %request.to_account))]
    pub async fn transfer(
        &self,
        job_id: JobId,
        request: &TransferRequest,
    ) -> OrchestratorResult<LedgerOperation> {
        if request.from_account == request.to_account {
            return Err(OrchestratorError::invalid_params("转出与转入账户不能相同"));
        }
        let amount = self.positive_amount(&request.amount)?;
        let _guards = self
            .lock_accounts(&[request.from_account.clone(), request.to_account.clone()])
            .await;

        let from = self
            .load_customer(&request.from_account, &request.currency)
            .await?;
        let to = self
            .load_customer(&request.to_account, &request.currency)
            .await?;
        ensure_sufficient(&from, &amount)?;

        let operation = LedgerOperation::new(
            LedgerOperationKind::Transfer,
            &from.currency,
            vec![self.entry(&from, -amount.clone()), self.entry(&to, amount)],
            request.reference.clone(),
        );
        self.commit(job_id, operation).await
    }

    /// 余额调整。负向调整最多扣到零，实际变动量写入操作
    #[instrument(skip_all, fields(job_id = %job_id, account = %request.account_id))]
    pub async fn adjust(
        &self,
        job_id: JobId,
        request: &AdjustmentRequest,
    ) -> OrchestratorResult<LedgerOperation> {
        let delta = self.precision.round(&request.delta);
        let adjustment_id = self.adjustment_account(&request.currency);
        let _guards = self
            .lock_accounts(&[request.account_id.clone(), adjustment_id.clone()])
            .await;

        let account = self
            .load_customer(&request.account_id, &request.currency)
            .await?;
        let counterpart = self.load_system(&adjustment_id, &request.currency).await?;

        let effective = if (&account.balance + &delta).is_negative() {
            -account.balance.clone()
        } else {
            delta.clone()
        };
        if effective != delta {
            warn!(requested = %delta, applied = %effective, "调整后余额将为负，按零截断");
        }

        let operation = LedgerOperation::new(
            LedgerOperationKind::Adjustment,
            &account.currency,
            vec![
                self.entry(&account, effective.clone()),
                self.entry(&counterpart, -effective),
            ],
            Some(request.reason.clone()),
        );
        self.commit(job_id, operation).await
    }

    async fn commit(
        &self,
        job_id: JobId,
        operation: LedgerOperation,
    ) -> OrchestratorResult<LedgerOperation> {
        operation.verify_conservation()?;

        match self.repository.commit(job_id, &operation).await {
            Ok(()) => {
                self.metrics.record_ledger_commit(operation.kind.as_str());
                debug!(operation_id = %operation.id, kind = operation.kind.as_str(), "账本操作已提交");
                Ok(operation)
            }
            Err(e) => {
                self.metrics.record_ledger_rollback(operation.kind.as_str());
                warn!(operation_id = %operation.id, error = %e, "账本操作已回滚");
                self.events.publish(LifecycleEvent::LedgerRolledBack {
                    job_id,
                    operation_id: operation.id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn entry(&self, account: &Account, delta: BigDecimal) -> LedgerEntry {
        let balance_after = self.precision.round(&(&account.balance + &delta));
        LedgerEntry {
            account_id: account.id.clone(),
            delta,
            balance_before: account.balance.clone(),
            balance_after,
            expected_version: account.version,
        }
    }

    fn positive_amount(&self, amount: &BigDecimal) -> OrchestratorResult<BigDecimal> {
        let amount = self.precision.round(amount);
        if !amount.is_positive() {
            return Err(OrchestratorError::invalid_params(format!(
                "金额必须大于0，实际为 {amount}"
            )));
        }
        Ok(amount)
    }

    fn is_system_id(&self, id: &AccountId) -> bool {
        id.as_str().starts_with(&self.config.clearing_account_prefix)
            || id.as_str().starts_with(&self.config.adjustment_account_prefix)
    }

    async fn load_customer(&self, id: &AccountId, currency: &str) -> OrchestratorResult<Account> {
        let account = self.account(id).await?;
        if account.is_system() {
            return Err(OrchestratorError::invalid_params(format!(
                "不能直接操作系统账户 {id}"
            )));
        }
        if !account.currency.eq_ignore_ascii_case(currency) {
            return Err(OrchestratorError::CurrencyMismatch {
                account: id.to_string(),
                expected: account.currency,
                actual: currency.to_uppercase(),
            });
        }
        Ok(account)
    }

    /// 读取系统账户，不存在时按需创建
    async fn load_system(&self, id: &AccountId, currency: &str) -> OrchestratorResult<Account> {
        if let Some(account) = self.repository.find_account(id).await? {
            return Ok(account);
        }
        let account = Account::system(id.clone(), currency);
        match self.repository.open_account(&account).await {
            Ok(()) => {
                info!(account = %id, "系统账户已创建");
                Ok(account)
            }
            Err(OrchestratorError::AccountAlreadyExists { .. }) => self.account(id).await,
            Err(e) => Err(e),
        }
    }

    /// 按账户ID顺序获取锁
    async fn lock_accounts(&self, ids: &[AccountId]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock();
            ids.iter()
                .map(|id| locks.entry(id.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }
}

fn ensure_sufficient(account: &Account, amount: &BigDecimal) -> OrchestratorResult<()> {
    if &account.balance < amount {
        return Err(OrchestratorError::InsufficientFunds {
            account: account.id.to_string(),
            available: account.balance.to_string(),
            requested: amount.to_string(),
        });
    }
    Ok(())
}
