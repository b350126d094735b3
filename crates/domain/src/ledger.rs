//! 账本模型
//!
//! 所有金额使用 [`BigDecimal`] 定点运算，按配置的小数位数四舍五入（half-up）。

use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{AccountId, JobId};

/// 定点精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precision {
    decimal_places: u32,
}

impl Precision {
    pub fn new(decimal_places: u32) -> Self {
        Self { decimal_places }
    }

    pub fn decimal_places(&self) -> u32 {
        self.decimal_places
    }

    /// 按配置小数位数做 half-up 舍入
    pub fn round(&self, value: &BigDecimal) -> BigDecimal {
        value.with_scale_round(i64::from(self.decimal_places), RoundingMode::HalfUp)
    }

    /// 值在当前精度下是否无需舍入
    pub fn is_exact(&self, value: &BigDecimal) -> bool {
        &self.round(value) == value
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::new(8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    /// 客户账户，余额不得为负
    Customer,
    /// 清算/调整等系统账户，作为守恒的对手方，允许为负
    System,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Customer => "CUSTOMER",
            AccountKind::System => "SYSTEM",
        }
    }
}

impl std::str::FromStr for AccountKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CUSTOMER" => Ok(AccountKind::Customer),
            "SYSTEM" => Ok(AccountKind::System),
            _ => Err(OrchestratorError::Serialization(format!(
                "无效的账户类型: {s}"
            ))),
        }
    }
}

/// 账户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub currency: String,
    pub balance: BigDecimal,
    pub kind: AccountKind,
    /// 乐观并发版本号，每次提交加一
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn customer(id: AccountId, currency: &str, opening_balance: BigDecimal) -> Self {
        let now = Utc::now();
        Self {
            id,
            currency: currency.to_uppercase(),
            balance: opening_balance,
            kind: AccountKind::Customer,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn system(id: AccountId, currency: &str) -> Self {
        Self {
            kind: AccountKind::System,
            ..Self::customer(id, currency, BigDecimal::zero())
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == AccountKind::System
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerOperationKind {
    Debit,
    Transfer,
    Adjustment,
}

impl LedgerOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOperationKind::Debit => "DEBIT",
            LedgerOperationKind::Transfer => "TRANSFER",
            LedgerOperationKind::Adjustment => "ADJUSTMENT",
        }
    }
}

/// 单个账户的变动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account_id: AccountId,
    pub delta: BigDecimal,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    /// 读取余额时的版本号，提交时用于冲突检测
    pub expected_version: u64,
}

/// 一次原子账本操作，包含所有受影响账户的变动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerOperation {
    pub id: Uuid,
    pub kind: LedgerOperationKind,
    pub currency: String,
    pub entries: Vec<LedgerEntry>,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerOperation {
    pub fn new(
        kind: LedgerOperationKind,
        currency: &str,
        entries: Vec<LedgerEntry>,
        reference: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            currency: currency.to_string(),
            entries,
            reference,
            created_at: Utc::now(),
        }
    }

    /// 所有变动之和
    pub fn net_delta(&self) -> BigDecimal {
        self.entries
            .iter()
            .fold(BigDecimal::zero(), |acc, entry| acc + &entry.delta)
    }

    /// 校验守恒：变动之和为零，且每条变动前后余额自洽
    pub fn verify_conservation(&self) -> OrchestratorResult<()> {
        let net = self.net_delta();
        if !net.is_zero() {
            return Err(OrchestratorError::ConservationViolated(format!(
                "操作 {} 净变动为 {}",
                self.id, net
            )));
        }
        for entry in &self.entries {
            if &entry.balance_before + &entry.delta != entry.balance_after {
                return Err(OrchestratorError::ConservationViolated(format!(
                    "账户 {} 变动前后余额不一致",
                    entry.account_id
                )));
            }
        }
        Ok(())
    }

    pub fn entry_for(&self, account_id: &AccountId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| &e.account_id == account_id)
    }
}

/// 审计记录，一次操作对应一条（转账的借贷两方合并在同一条中）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub operation: LedgerOperation,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(job_id: JobId, operation: LedgerOperation) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            operation,
            recorded_at: Utc::now(),
        }
    }

    pub fn touches(&self, account_id: &AccountId) -> bool {
        self.operation.entry_for(account_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_half_up() {
        let p = Precision::new(2);
        assert_eq!(p.round(&dec("1.005")), dec("1.01"));
        assert_eq!(p.round(&dec("1.004")), dec("1.00"));
        assert_eq!(p.round(&dec("-1.005")), dec("-1.01"));
        assert_eq!(p.round(&dec("2.5")), dec("2.50"));
    }

    #[test]
    fn test_eight_places_is_exact() {
        let p = Precision::new(8);
        assert!(p.is_exact(&dec("100.00000000")));
        assert!(p.is_exact(&dec("100")));
        assert!(!p.is_exact(&dec("0.000000001")));
    }

    fn entry(account: &str, before: &str, delta: &str) -> LedgerEntry {
        let before = dec(before);
        let delta = dec(delta);
        LedgerEntry {
            account_id: AccountId::new(account),
            balance_after: &before + &delta,
            balance_before: before,
            delta,
            expected_version: 0,
        }
    }

    #[test]
    fn test_conservation_holds_for_balanced_entries() {
        let op = LedgerOperation::new(
            LedgerOperationKind::Transfer,
            "USD",
            vec![entry("a", "100", "-40.5"), entry("b", "0", "40.5")],
            None,
        );
        assert!(op.verify_conservation().is_ok());
        assert!(op.net_delta().is_zero());
    }

    #[test]
    fn test_conservation_rejects_unbalanced_entries() {
        let op = LedgerOperation::new(
            LedgerOperationKind::Debit,
            "USD",
            vec![entry("a", "100", "-40")],
            None,
        );
        assert!(matches!(
            op.verify_conservation(),
            Err(OrchestratorError::ConservationViolated(_))
        ));

        let mut bad = entry("b", "0", "40");
        bad.balance_after = dec("41");
        let op = LedgerOperation::new(
            LedgerOperationKind::Transfer,
            "USD",
            vec![entry("a", "100", "-40"), bad],
            None,
        );
        assert!(op.verify_conservation().is_err());
    }
}
