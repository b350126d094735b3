pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod logging;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, CircuitTransition,
};
pub use config::*;
pub use errors::*;
pub use logging::{init_logging, LogFormat};
