pub mod admission;
pub mod app_config;
pub mod database;
pub mod execution;
pub mod observability;
pub mod registry;
pub mod scheduler;

pub use admission::{AdmissionConfig, DegradationConfig};
pub use app_config::{AppConfig, WorkerPoolConfig};
pub use database::{DatabaseBackend, DatabaseConfig};
pub use execution::{ExecutionConfig, LedgerConfig, RulesConfig};
pub use observability::ObservabilityConfig;
pub use registry::{RateLimitConfig, RegistryConfig};
pub use scheduler::SchedulerConfig;
