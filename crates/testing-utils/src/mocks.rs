//! Fakes for the collaborator traits
//!
//! These keep their state behind `std::sync::Mutex` and are meant for tests only.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{CircuitState, OrchestratorError, OrchestratorResult};
use orchestrator_domain::{
    EventSink, ExecutionOutcome, ExecutionStatus, JobId, LifecycleEvent, ResourceMetricsSource,
    ResourceSnapshot, Task, TaskExecutor, TaskId, WorkerId,
};

/// Event sink that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    /// Breaker transitions of one worker, in publish order
    pub fn breaker_transitions(&self, worker_id: WorkerId) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::BreakerTransition {
                    worker_id: id,
                    from,
                    to,
                } if *id == worker_id => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// Task ids in assignment order
    pub fn assignment_order(&self) -> Vec<TaskId> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::TaskAssigned { task_id, .. } => Some(*task_id),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Resource metrics source whose snapshot is set by the test
#[derive(Debug)]
pub struct StaticMetricsSource {
    snapshot: Mutex<ResourceSnapshot>,
    failing: Mutex<bool>,
}

impl Default for StaticMetricsSource {
    fn default() -> Self {
        Self {
            snapshot: Mutex::new(ResourceSnapshot::idle()),
            failing: Mutex::new(false),
        }
    }
}

impl StaticMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cpu_percent: f64, memory_percent: f64, active_connections: usize) {
        *self.snapshot.lock().unwrap() =
            ResourceSnapshot::new(cpu_percent, memory_percent, active_connections);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl ResourceMetricsSource for StaticMetricsSource {
    async fn snapshot(&self) -> OrchestratorResult<ResourceSnapshot> {
        if *self.failing.lock().unwrap() {
            return Err(OrchestratorError::internal("metrics source unavailable"));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

/// One scripted response of [`ScriptedExecutor`]
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub delay: Duration,
    pub error: Option<OrchestratorError>,
}

impl ScriptedStep {
    pub fn success() -> Self {
        Self {
            delay: Duration::ZERO,
            error: None,
        }
    }

    pub fn failure(error: OrchestratorError) -> Self {
        Self {
            delay: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A recorded call to [`ScriptedExecutor::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCall {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
}

/// Task executor that replays a script
///
/// Steps are consumed in call order; once the script is empty every call
/// succeeds after `default_delay`. Workers marked failing always fail.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<ScriptedStep>>,
    default_delay: Mutex<Duration>,
    failing_workers: Mutex<HashSet<WorkerId>>,
    calls: Mutex<Vec<ExecutionCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_delay(delay: Duration) -> Self {
        let executor = Self::default();
        *executor.default_delay.lock().unwrap() = delay;
        executor
    }

    pub fn push(&self, step: ScriptedStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn fail_on_worker(&self, worker_id: WorkerId) {
        self.failing_workers.lock().unwrap().insert(worker_id);
    }

    pub fn heal_worker(&self, worker_id: WorkerId) {
        self.failing_workers.lock().unwrap().remove(&worker_id);
    }

    pub fn calls(&self) -> Vec<ExecutionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of concurrent executions observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, worker_id: Option<WorkerId>) -> ScriptedStep {
        if let Some(id) = worker_id {
            if self.failing_workers.lock().unwrap().contains(&id) {
                return ScriptedStep::failure(OrchestratorError::WorkerFailure(format!(
                    "{id} scripted failure"
                )));
            }
        }
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedStep::success().after(*self.default_delay.lock().unwrap()))
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> OrchestratorResult<ExecutionOutcome> {
        self.calls.lock().unwrap().push(ExecutionCall {
            task_id: task.id,
            worker_id: task.assigned_worker,
        });
        let step = self.next_step(task.assigned_worker);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step.error {
            Some(error) => Err(error),
            None => Ok(ExecutionOutcome {
                job_id: JobId::new(),
                status: ExecutionStatus::Succeeded,
                result: Some(serde_json::json!({ "task_id": task.id.to_string() })),
                error: None,
                duplicate: false,
                warnings: Vec::new(),
            }),
        }
    }
}
