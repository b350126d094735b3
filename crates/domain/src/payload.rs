//! 任务负载
//!
//! 每种任务类型对应一个强类型负载，执行核心对其做穷尽匹配。

use bigdecimal::{BigDecimal, Zero};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use crate::ledger::Precision;
use crate::value_objects::AccountId;

/// 任务逻辑类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    PaymentProcessing,
    BalanceTransfer,
    BalanceAdjustment,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::PaymentProcessing => "PAYMENT_PROCESSING",
            TaskKind::BalanceTransfer => "BALANCE_TRANSFER",
            TaskKind::BalanceAdjustment => "BALANCE_ADJUSTMENT",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAYMENT_PROCESSING" => Ok(TaskKind::PaymentProcessing),
            "BALANCE_TRANSFER" => Ok(TaskKind::BalanceTransfer),
            "BALANCE_ADJUSTMENT" => Ok(TaskKind::BalanceAdjustment),
            _ => Err(OrchestratorError::invalid_params(format!(
                "未知的任务类型: {s}"
            ))),
        }
    }
}

/// 单账户扣款
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitRequest {
    pub account_id: AccountId,
    pub amount: BigDecimal,
    pub currency: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// 双账户转账
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: BigDecimal,
    pub currency: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// 余额调整，`delta` 可正可负，结果余额不低于零
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub account_id: AccountId,
    pub delta: BigDecimal,
    pub currency: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPayload {
    PaymentProcessing(DebitRequest),
    BalanceTransfer(TransferRequest),
    BalanceAdjustment(AdjustmentRequest),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::PaymentProcessing(_) => TaskKind::PaymentProcessing,
            TaskPayload::BalanceTransfer(_) => TaskKind::BalanceTransfer,
            TaskPayload::BalanceAdjustment(_) => TaskKind::BalanceAdjustment,
        }
    }

    pub fn currency(&self) -> &str {
        match self {
            TaskPayload::PaymentProcessing(r) => &r.currency,
            TaskPayload::BalanceTransfer(r) => &r.currency,
            TaskPayload::BalanceAdjustment(r) => &r.currency,
        }
    }

    /// 负载中的主金额（调整为绝对值）
    pub fn amount(&self) -> BigDecimal {
        match self {
            TaskPayload::PaymentProcessing(r) => r.amount.clone(),
            TaskPayload::BalanceTransfer(r) => r.amount.clone(),
            TaskPayload::BalanceAdjustment(r) => r.delta.abs(),
        }
    }

    /// 负载涉及的客户账户，按规范顺序排列
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts = match self {
            TaskPayload::PaymentProcessing(r) => vec![r.account_id.clone()],
            TaskPayload::BalanceTransfer(r) => vec![r.from_account.clone(), r.to_account.clone()],
            TaskPayload::BalanceAdjustment(r) => vec![r.account_id.clone()],
        };
        accounts.sort();
        accounts.dedup();
        accounts
    }

    /// 结构校验：字段非空、币种格式。业务约束（金额为正等）由规则引擎负责
    pub fn validate(&self) -> OrchestratorResult<()> {
        let currency = self.currency();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(OrchestratorError::invalid_params(format!(
                "无效的币种代码: {currency}"
            )));
        }
        match self {
            TaskPayload::PaymentProcessing(r) => {
                require_account(&r.account_id, "account_id")?;
            }
            TaskPayload::BalanceTransfer(r) => {
                require_account(&r.from_account, "from_account")?;
                require_account(&r.to_account, "to_account")?;
            }
            TaskPayload::BalanceAdjustment(r) => {
                require_account(&r.account_id, "account_id")?;
                if r.reason.trim().is_empty() {
                    return Err(OrchestratorError::invalid_params("余额调整必须填写原因"));
                }
                if r.delta.is_zero() {
                    return Err(OrchestratorError::invalid_params("调整金额不能为0"));
                }
            }
        }
        Ok(())
    }

    /// 规范化：金额按精度舍入、币种大写。相同逻辑请求规范化后完全相同
    pub fn normalized(&self, precision: &Precision) -> TaskPayload {
        match self {
            TaskPayload::PaymentProcessing(r) => TaskPayload::PaymentProcessing(DebitRequest {
                amount: precision.round(&r.amount),
                currency: r.currency.to_uppercase(),
                ..r.clone()
            }),
            TaskPayload::BalanceTransfer(r) => TaskPayload::BalanceTransfer(TransferRequest {
                amount: precision.round(&r.amount),
                currency: r.currency.to_uppercase(),
                ..r.clone()
            }),
            TaskPayload::BalanceAdjustment(r) => {
                TaskPayload::BalanceAdjustment(AdjustmentRequest {
                    delta: precision.round(&r.delta),
                    currency: r.currency.to_uppercase(),
                    ..r.clone()
                })
            }
        }
    }
}

fn require_account(id: &AccountId, field: &str) -> OrchestratorResult<()> {
    if id.as_str().trim().is_empty() {
        return Err(OrchestratorError::invalid_params(format!("{field} 不能为空")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn debit(amount: &str) -> TaskPayload {
        TaskPayload::PaymentProcessing(DebitRequest {
            account_id: AccountId::new("acc-1"),
            amount: BigDecimal::from_str(amount).unwrap(),
            currency: "usd".to_string(),
            reference: None,
        })
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let json = serde_json::to_value(debit("100")).unwrap();
        assert_eq!(json["type"], "PAYMENT_PROCESSING");
        assert_eq!(json["data"]["account_id"], "acc-1");

        let parsed: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), TaskKind::PaymentProcessing);
    }

    #[test]
    fn test_normalized_rounds_and_uppercases() {
        let p = Precision::new(8);
        let a = debit("100").normalized(&p);
        let b = debit("100.00000000").normalized(&p);
        assert_eq!(a, b);
        assert_eq!(a.currency(), "USD");
    }

    #[test]
    fn test_transfer_accounts_are_sorted() {
        let payload = TaskPayload::BalanceTransfer(TransferRequest {
            from_account: AccountId::new("zeta"),
            to_account: AccountId::new("alpha"),
            amount: BigDecimal::from(10),
            currency: "USD".to_string(),
            reference: None,
        });
        assert_eq!(
            payload.accounts(),
            vec![AccountId::new("alpha"), AccountId::new("zeta")]
        );
    }

    #[test]
    fn test_validate_rejects_bad_shape() {
        let mut payload = debit("1");
        if let TaskPayload::PaymentProcessing(r) = &mut payload {
            r.currency = "US".to_string();
        }
        assert!(payload.validate().is_err());

        let adjustment = TaskPayload::BalanceAdjustment(AdjustmentRequest {
            account_id: AccountId::new("acc-1"),
            delta: BigDecimal::from(5),
            currency: "USD".to_string(),
            reason: " ".to_string(),
        });
        assert!(adjustment.validate().is_err());
    }
}
