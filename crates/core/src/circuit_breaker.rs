use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - assignments are blocked
    Open,
    /// Circuit is half-open - a single trial is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time spent open before the half-open trial (milliseconds)
    pub reset_timeout_ms: u64,
    /// Successful trials in half-open before closing
    pub success_threshold: u32,
    /// Multiplier applied to the reset timeout when a trial fails
    pub backoff_multiplier: f64,
    /// Upper bound for the reset timeout (milliseconds)
    pub max_reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 1,
            backoff_multiplier: 1.0,
            max_reset_timeout_ms: 300_000, // 5 minutes
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn max_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.max_reset_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("熔断失败阈值必须大于0"));
        }
        if self.success_threshold == 0 {
            return Err(anyhow::anyhow!("半开成功阈值必须大于0"));
        }
        if self.reset_timeout_ms == 0 {
            return Err(anyhow::anyhow!("熔断重置超时必须大于0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("熔断退避倍数不能小于1.0"));
        }
        if self.max_reset_timeout_ms < self.reset_timeout_ms {
            return Err(anyhow::anyhow!("最大重置超时不能小于重置超时"));
        }
        Ok(())
    }
}

/// A state change produced by the breaker, reported to the event sink by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub current_reset_timeout: Duration,
}

impl CircuitBreakerStats {
    /// Calculate failure rate
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

/// Per-worker circuit breaker.
///
/// The breaker is a plain state machine; it does not own a lock or a timer.
/// The owner (the worker registry) serialises access and schedules the
/// open -> half-open transition after [`CircuitBreaker::current_reset_timeout`],
/// passing back the generation returned when the circuit opened so that a
/// stale timer cannot move a re-opened circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    last_failure_at: Option<Instant>,
    last_state_change: Instant,
    current_reset_timeout: Duration,
    generation: u64,
    trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_reset_timeout = config.reset_timeout();
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            last_failure_at: None,
            last_state_change: Instant::now(),
            current_reset_timeout,
            generation: 0,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Generation of the current open period.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_reset_timeout(&self) -> Duration {
        self.current_reset_timeout
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    pub fn last_state_change(&self) -> Instant {
        self.last_state_change
    }

    /// Whether a new assignment may be routed through this breaker.
    pub fn allows_assignment(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_in_flight,
        }
    }

    /// Reserve the single half-open trial slot. No-op in other states.
    pub fn begin_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = true;
        }
    }

    /// Release a trial slot without an outcome, e.g. when an assignment is abandoned.
    pub fn abandon_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        self.total_calls += 1;
        self.successful_calls += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;

        if self.state == CircuitState::HalfOpen
            && self.consecutive_successes >= self.config.success_threshold
        {
            self.current_reset_timeout = self.config.reset_timeout();
            return Some(self.transition(CircuitState::Closed));
        }
        None
    }

    pub fn record_failure(&mut self) -> Option<CircuitTransition> {
        self.total_calls += 1;
        self.failed_calls += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
        self.last_failure_at = Some(Instant::now());

        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.current_reset_timeout = self.config.reset_timeout();
                self.generation += 1;
                Some(self.transition(CircuitState::Open))
            }
            CircuitState::HalfOpen => {
                // A failed trial re-opens the circuit and restarts the timer
                let next = Duration::from_millis(
                    (self.current_reset_timeout.as_millis() as f64 * self.config.backoff_multiplier)
                        as u64,
                );
                self.current_reset_timeout = next.min(self.config.max_reset_timeout());
                self.generation += 1;
                Some(self.transition(CircuitState::Open))
            }
            _ => None,
        }
    }

    /// Scheduled open -> half-open transition. Ignored when the generation is stale.
    pub fn try_half_open(&mut self, generation: u64) -> Option<CircuitTransition> {
        if self.state != CircuitState::Open || self.generation != generation {
            return None;
        }
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
        Some(self.transition(CircuitState::HalfOpen))
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            current_reset_timeout: self.current_reset_timeout,
        }
    }

    fn transition(&mut self, to: CircuitState) -> CircuitTransition {
        let from = self.state;
        self.state = to;
        self.last_state_change = Instant::now();
        if to == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
        CircuitTransition { from, to }
    }
}
