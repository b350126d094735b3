//! 执行核心：内容哈希去重、业务规则、原子账本变更与执行记录

pub mod executor;
pub mod hashing;
pub mod ledger;
pub mod rules;

pub use executor::ExecutionCore;
pub use hashing::idempotency_key;
pub use ledger::LedgerService;
pub use rules::{BusinessRule, RuleEngine, RuleFinding, RuleSeverity};
