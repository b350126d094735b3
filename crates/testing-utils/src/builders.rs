//! Test data builders

use std::str::FromStr;

use bigdecimal::BigDecimal;
use orchestrator_domain::{
    Account, AccountId, AdjustmentRequest, DebitRequest, SubmitTaskRequest, TaskPayload,
    TaskPriority, TransferRequest,
};

/// Parse a decimal literal. Panics on malformed input.
pub fn dec(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap_or_else(|_| panic!("invalid decimal literal: {value}"))
}

/// Customer account in USD with the given opening balance
pub fn usd_account(id: &str, balance: &str) -> Account {
    Account::customer(AccountId::new(id), "USD", dec(balance))
}

/// Builder for [`SubmitTaskRequest`]
pub struct SubmitRequestBuilder {
    request: SubmitTaskRequest,
}

impl SubmitRequestBuilder {
    pub fn from_payload(payload: TaskPayload) -> Self {
        Self {
            request: SubmitTaskRequest::new(payload),
        }
    }

    pub fn debit(account: &str, amount: &str) -> Self {
        Self::from_payload(TaskPayload::PaymentProcessing(DebitRequest {
            account_id: AccountId::new(account),
            amount: dec(amount),
            currency: "USD".to_string(),
            reference: None,
        }))
    }

    pub fn transfer(from: &str, to: &str, amount: &str) -> Self {
        Self::from_payload(TaskPayload::BalanceTransfer(TransferRequest {
            from_account: AccountId::new(from),
            to_account: AccountId::new(to),
            amount: dec(amount),
            currency: "USD".to_string(),
            reference: None,
        }))
    }

    pub fn adjustment(account: &str, delta: &str, reason: &str) -> Self {
        Self::from_payload(TaskPayload::BalanceAdjustment(AdjustmentRequest {
            account_id: AccountId::new(account),
            delta: dec(delta),
            currency: "USD".to_string(),
            reason: reason.to_string(),
        }))
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.request.priority = priority;
        self
    }

    pub fn with_worker_type(mut self, worker_type: &str) -> Self {
        self.request.required_worker_type = Some(worker_type.to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.request.max_retries = Some(max_retries);
        self
    }

    pub fn build(self) -> SubmitTaskRequest {
        self.request
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.request.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::TaskKind;

    #[test]
    fn test_builder_defaults() {
        let request = SubmitRequestBuilder::debit("acc-1", "10").build();
        assert_eq!(request.priority, TaskPriority::Medium);
        assert_eq!(request.kind(), TaskKind::PaymentProcessing);
        assert!(request.required_worker_type.is_none());
        assert!(request.max_retries.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let request = SubmitRequestBuilder::transfer("a", "b", "1.5")
            .with_priority(TaskPriority::Critical)
            .with_worker_type("ledger")
            .with_max_retries(1)
            .build();
        assert_eq!(request.priority, TaskPriority::Critical);
        assert_eq!(request.required_worker_type.as_deref(), Some("ledger"));
        assert_eq!(request.max_retries, Some(1));
    }
}
