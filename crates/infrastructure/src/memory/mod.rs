//! 内存仓储实现，默认后端，也用于测试

pub mod execution_repository;
pub mod ledger_repository;
pub mod task_repository;

pub use execution_repository::InMemoryExecutionRecordRepository;
pub use ledger_repository::InMemoryLedgerRepository;
pub use task_repository::InMemoryTaskRepository;
