//! # Orchestrator Testing Utils
//!
//! Shared builders and fakes for the orchestration workspace.
//!
//! - **Builders**: submit requests and ledger fixtures with sensible defaults
//! - **Fakes**: a recording event sink, a settable resource-metrics source and
//!   a scripted task executor
//! - **Helpers**: polling waits and test logging
//!
//! ```toml
//! [dev-dependencies]
//! orchestrator-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
