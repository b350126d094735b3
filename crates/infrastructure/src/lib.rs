pub mod database;
pub mod memory;
pub mod observability;
pub mod resource_monitor;

pub use database::{
    DatabaseManager, DbPool, SqliteExecutionRecordRepository, SqliteLedgerRepository,
    SqliteTaskRepository,
};
pub use memory::{InMemoryExecutionRecordRepository, InMemoryLedgerRepository, InMemoryTaskRepository};
pub use observability::{
    init_metrics, ChannelEventSink, CompositeEventSink, MetricsCollector, TracingEventSink,
};
pub use resource_monitor::{ResourceMonitor, ResourceMonitorConfig};
