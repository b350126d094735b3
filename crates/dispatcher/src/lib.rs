pub mod admission;
pub mod queue;
pub mod retry_service;
pub mod scheduler;
pub mod strategies;
pub mod supervisor;
pub mod worker_registry;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionPermit, AdmissionTicket};
pub use queue::{QueueEntry, TaskQueue};
pub use retry_service::RetryPolicy;
pub use scheduler::{RunningTask, TaskOrchestrator};
pub use strategies::{LeastLoadedStrategy, WorkerCandidate, WorkerSelectionStrategy};
pub use supervisor::{Supervisor, SupervisorConfig, SweepReport};
pub use worker_registry::WorkerRegistry;
