use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{
    AdmissionConfig, CircuitBreakerConfig, CircuitState, DegradationConfig, OrchestratorError,
    RegistryConfig, SchedulerConfig,
};
use orchestrator_dispatcher::{AdmissionController, TaskOrchestrator, WorkerRegistry};
use orchestrator_domain::{
    ResourceSnapshot, TaskPriority, TaskRepository, TaskStatus, WorkerId, WorkerSpec,
};
use orchestrator_infrastructure::InMemoryTaskRepository;
use orchestrator_testing_utils::{
    wait_for, RecordingEventSink, ScriptedExecutor, ScriptedStep, SubmitRequestBuilder,
};
use tokio::sync::broadcast;

struct Harness {
    orchestrator: TaskOrchestrator,
    executor: Arc<ScriptedExecutor>,
    events: Arc<RecordingEventSink>,
    tasks: Arc<InMemoryTaskRepository>,
    shutdown: broadcast::Sender<()>,
}

impl Harness {
    fn new() -> Self {
        Self::with(scheduler_config(), admission_config())
    }

    fn with(scheduler: SchedulerConfig, admission: AdmissionConfig) -> Self {
        Self::build(scheduler, admission, ScriptedExecutor::new())
    }

    fn build(
        scheduler: SchedulerConfig,
        admission: AdmissionConfig,
        executor: ScriptedExecutor,
    ) -> Self {
        let events = Arc::new(RecordingEventSink::new());
        let executor = Arc::new(executor);
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let registry = WorkerRegistry::new(registry_config(), events.clone());
        let orchestrator = TaskOrchestrator::new(
            scheduler,
            registry,
            AdmissionController::new(admission),
            executor.clone(),
            tasks.clone(),
            events.clone(),
        );
        let (shutdown, _) = broadcast::channel(1);
        Self {
            orchestrator,
            executor,
            events,
            tasks,
            shutdown,
        }
    }

    fn start(&self) {
        self.orchestrator.spawn(self.shutdown.subscribe());
    }

    async fn worker(&self, worker_type: &str, capacity: u32) -> WorkerId {
        self.orchestrator
            .register_worker(WorkerSpec::new(worker_type, capacity))
            .await
            .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: 16,
        task_timeout_ms: 2_000,
        default_max_retries: 3,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        retry_backoff_multiplier: 2.0,
        retry_jitter_factor: 0.0,
        dispatch_interval_ms: 20,
        supervisor_interval_ms: 50,
    }
}

fn registry_config() -> RegistryConfig {
    RegistryConfig {
        default_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            ..CircuitBreakerConfig::default()
        },
        ..RegistryConfig::default()
    }
}

fn admission_config() -> AdmissionConfig {
    AdmissionConfig {
        max_in_flight: 64,
        max_queue_size: 16,
        queue_timeout_ms: 2_000,
        ..AdmissionConfig::default()
    }
}

fn debit() -> SubmitRequestBuilder {
    SubmitRequestBuilder::debit("acc-1", "10.00")
}

#[tokio::test]
async fn test_assignment_follows_priority_then_arrival() {
    let h = Harness::new();
    let low = h
        .orchestrator
        .submit_task(debit().with_priority(TaskPriority::Low).build())
        .await
        .unwrap();
    let critical = h
        .orchestrator
        .submit_task(debit().with_priority(TaskPriority::Critical).build())
        .await
        .unwrap();
    let medium = h
        .orchestrator
        .submit_task(debit().with_priority(TaskPriority::Medium).build())
        .await
        .unwrap();
    let medium_later = h
        .orchestrator
        .submit_task(debit().with_priority(TaskPriority::Medium).build())
        .await
        .unwrap();
    assert_eq!(h.orchestrator.stats().await.pending, 4);

    h.worker("ledger", 1).await;
    h.start();

    for id in [low, critical, medium, medium_later] {
        let task = h.orchestrator.wait_for_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert_eq!(
        h.events.assignment_order(),
        vec![critical, medium, medium_later, low]
    );
}

#[tokio::test]
async fn test_failing_worker_is_isolated_by_breaker() {
    let h = Harness::new();
    let flaky = h.worker("ledger", 1).await;
    let healthy = h.worker("ledger", 1).await;
    h.executor.fail_on_worker(flaky);

    for _ in 0..5 {
        let id = h
            .orchestrator
            .submit_task(debit().with_max_retries(1).build())
            .await
            .unwrap();
        let task = h.orchestrator.wait_for_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.assigned_worker, Some(flaky));
    }
    assert_eq!(
        h.events.breaker_transitions(flaky),
        vec![(CircuitState::Closed, CircuitState::Open)]
    );

    let id = h
        .orchestrator
        .submit_task(debit().with_max_retries(1).build())
        .await
        .unwrap();
    let task = h.orchestrator.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let calls = h.executor.calls();
    assert_eq!(calls.len(), 6);
    assert!(calls[..5].iter().all(|c| c.worker_id == Some(flaky)));
    assert_eq!(calls[5].worker_id, Some(healthy));
}

#[tokio::test]
async fn test_load_stays_within_capacity() {
    let h = Harness::build(
        scheduler_config(),
        admission_config(),
        ScriptedExecutor::with_default_delay(Duration::from_millis(30)),
    );
    h.worker("ledger", 2).await;
    h.start();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(h.orchestrator.submit_task(debit().build()).await.unwrap());
    }
    for id in ids {
        let task = h.orchestrator.wait_for_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert!(h.executor.peak_in_flight() <= 2);
    assert_eq!(h.executor.call_count(), 6);

    let stats = h.orchestrator.stats().await;
    assert_eq!(stats.completed_today, 6);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total_workers, 1);
    assert_eq!(stats.available_workers, 1);
}

#[tokio::test]
async fn test_timeout_fails_attempt_and_discards_late_result() {
    let h = Harness::with(
        SchedulerConfig {
            task_timeout_ms: 50,
            ..scheduler_config()
        },
        admission_config(),
    );
    let worker = h.worker("ledger", 1).await;
    h.executor
        .push(ScriptedStep::success().after(Duration::from_millis(200)));

    let id = h
        .orchestrator
        .submit_task(debit().with_max_retries(1).build())
        .await
        .unwrap();
    let task = h.orchestrator.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.job_id.is_none());
    assert!(task.last_error.unwrap().contains("超时"));

    let events = h.events.clone();
    let discarded = || {
        let events = events.clone();
        async move { events.count("LateResultDiscarded") == 1 }
    };
    assert!(wait_for(discarded, Duration::from_secs(2)).await);

    let stored = h.tasks.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    let stats = h.orchestrator.stats().await;
    assert_eq!(stats.completed_today, 0);
    assert_eq!(stats.failed_today, 1);
    let snapshot = h.orchestrator.registry().snapshot(worker).await.unwrap();
    assert_eq!(snapshot.current_load, 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let h = Harness::new();
    h.worker("ledger", 1).await;
    h.start();
    h.executor.push(ScriptedStep::failure(OrchestratorError::WorkerFailure("flap".into())));
    h.executor.push(ScriptedStep::failure(OrchestratorError::database_error("busy")));

    let id = h
        .orchestrator
        .submit_task(debit().with_max_retries(3).build())
        .await
        .unwrap();
    let task = h.orchestrator.wait_for_task(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert!(task.job_id.is_some());
    assert_eq!(h.executor.call_count(), 3);
    assert_eq!(h.events.count("TaskRetrying"), 2);
    assert_eq!(h.events.count("TaskCompleted"), 1);
}

#[tokio::test]
async fn test_retries_stop_at_max_retries() {
    let h = Harness::new();
    let worker = h.worker("ledger", 1).await;
    h.executor.fail_on_worker(worker);
    h.start();

    let id = h
        .orchestrator
        .submit_task(debit().with_max_retries(2).build())
        .await
        .unwrap();
    let task = h.orchestrator.wait_for_task(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(h.executor.call_count(), 2);
    assert_eq!(h.events.count("TaskFailed"), 1);
}

#[tokio::test]
async fn test_business_rejection_fails_without_retry_or_breaker_penalty() {
    let h = Harness::new();
    let worker = h.worker("ledger", 1).await;
    h.executor
        .push(ScriptedStep::failure(OrchestratorError::InsufficientFunds {
            account: "acc-1".into(),
            available: "5".into(),
            requested: "10".into(),
        }));

    let id = h.orchestrator.submit_task(debit().build()).await.unwrap();
    let task = h.orchestrator.wait_for_task(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 1);
    assert!(task.last_error.unwrap().contains("余额不足"));
    assert_eq!(h.executor.call_count(), 1);

    let snapshot = h.orchestrator.registry().snapshot(worker).await.unwrap();
    assert_eq!(snapshot.error_rate, 0.0);
    assert_eq!(snapshot.circuit_state, CircuitState::Closed);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_queueing() {
    let h = Harness::new();
    let err = h
        .orchestrator
        .submit_task(SubmitRequestBuilder::adjustment("acc-1", "5", " ").build())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidTaskParams(_)));
    assert_eq!(h.orchestrator.stats().await.pending, 0);
    assert_eq!(h.orchestrator.admission().in_flight(), 0);
    assert_eq!(h.events.count("TaskSubmitted"), 0);
}

#[tokio::test]
async fn test_admission_limits_outstanding_tasks() {
    let h = Harness::with(
        scheduler_config(),
        AdmissionConfig {
            max_in_flight: 1,
            max_queue_size: 0,
            ..admission_config()
        },
    );
    let first = h.orchestrator.submit_task(debit().build()).await.unwrap();
    let err = h.orchestrator.submit_task(debit().build()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AdmissionRejected(_)));

    h.worker("ledger", 1).await;
    h.start();
    h.orchestrator.wait_for_task(first).await.unwrap();
    assert_eq!(h.orchestrator.admission().in_flight(), 0);
    assert!(h.orchestrator.submit_task(debit().build()).await.is_ok());
}

#[tokio::test]
async fn test_queued_submission_proceeds_when_slot_frees() {
    let h = Harness::with(
        scheduler_config(),
        AdmissionConfig {
            max_in_flight: 1,
            max_queue_size: 4,
            ..admission_config()
        },
    );
    let first = h.orchestrator.submit_task(debit().build()).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let second = tokio::spawn(async move { orchestrator.submit_task(debit().build()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.orchestrator.admission().waiting(), 1);

    h.worker("ledger", 1).await;
    h.start();
    h.orchestrator.wait_for_task(first).await.unwrap();
    let second = second.await.unwrap().unwrap();
    let task = h.orchestrator.wait_for_task(second).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_admission_timeout_surfaces_to_caller() {
    let h = Harness::with(
        scheduler_config(),
        AdmissionConfig {
            max_in_flight: 1,
            max_queue_size: 4,
            queue_timeout_ms: 30,
            ..admission_config()
        },
    );
    h.orchestrator.submit_task(debit().build()).await.unwrap();
    let err = h.orchestrator.submit_task(debit().build()).await.unwrap_err();
    assert_eq!(err, OrchestratorError::AdmissionTimeout);
}

#[tokio::test]
async fn test_paused_category_waits_for_recovery() {
    let h = Harness::with(
        scheduler_config(),
        AdmissionConfig {
            degradation: DegradationConfig {
                enabled: true,
                non_critical_categories: vec!["reporting".to_string(), "ledger".to_string()],
                exempt_categories: vec!["ledger".to_string()],
                active_caller_floor: 3,
            },
            ..admission_config()
        },
    );
    h.worker("reporting", 1).await;
    h.worker("ledger", 1).await;
    h.orchestrator
        .admission()
        .update_metrics(ResourceSnapshot::new(10.0, 10.0, 1));
    h.start();

    let report = h
        .orchestrator
        .submit_task(debit().with_worker_type("reporting").build())
        .await
        .unwrap();
    let ledger = h
        .orchestrator
        .submit_task(debit().with_worker_type("ledger").build())
        .await
        .unwrap();

    let task = h.orchestrator.wait_for_task(ledger).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        h.orchestrator.task(report).await.unwrap().status,
        TaskStatus::Pending
    );

    h.orchestrator
        .admission()
        .update_metrics(ResourceSnapshot::new(10.0, 10.0, 10));
    let task = h.orchestrator.wait_for_task(report).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_worker_health_summary() {
    let h = Harness::new();
    let a = h.worker("ledger", 1).await;
    h.worker("ledger", 1).await;
    h.executor.fail_on_worker(a);

    for _ in 0..5 {
        let id = h
            .orchestrator
            .submit_task(debit().with_max_retries(1).build())
            .await
            .unwrap();
        h.orchestrator.wait_for_task(id).await.unwrap();
    }

    let summary = h.orchestrator.worker_health().await;
    assert_eq!(summary.operational, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.health_score, 50.0);
    assert_eq!(h.orchestrator.workers().await.len(), 2);
}
