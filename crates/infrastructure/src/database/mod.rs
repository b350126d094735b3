pub mod sqlite;

pub use sqlite::{
    DatabaseManager, DbPool, SqliteExecutionRecordRepository, SqliteLedgerRepository,
    SqliteTaskRepository,
};
