pub mod entities;
pub mod events;
pub mod execution;
pub mod ledger;
pub mod payload;
pub mod ports;
pub mod repositories;
pub mod value_objects;
pub mod worker;

pub use entities::*;
pub use events::*;
pub use execution::*;
pub use ledger::*;
pub use orchestrator_core::{OrchestratorError, OrchestratorResult};
pub use payload::*;
pub use ports::*;
pub use repositories::*;
pub use value_objects::*;
pub use worker::*;
