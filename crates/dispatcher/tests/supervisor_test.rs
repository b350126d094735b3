use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{AdmissionConfig, RegistryConfig, SchedulerConfig};
use orchestrator_dispatcher::{
    AdmissionController, Supervisor, SupervisorConfig, TaskOrchestrator, WorkerRegistry,
};
use orchestrator_domain::{TaskStatus, WorkerHealth, WorkerSpec};
use orchestrator_infrastructure::InMemoryTaskRepository;
use orchestrator_testing_utils::{
    wait_for, RecordingEventSink, ScriptedExecutor, ScriptedStep, SubmitRequestBuilder,
};
use tokio::sync::broadcast;

fn setup(executor: Arc<ScriptedExecutor>) -> (TaskOrchestrator, Arc<RecordingEventSink>) {
    let events = Arc::new(RecordingEventSink::new());
    let registry = WorkerRegistry::new(
        RegistryConfig {
            heartbeat_interval_secs: 1,
            ..RegistryConfig::default()
        },
        events.clone(),
    );
    let orchestrator = TaskOrchestrator::new(
        SchedulerConfig {
            task_timeout_ms: 5_000,
            retry_jitter_factor: 0.0,
            dispatch_interval_ms: 20,
            ..SchedulerConfig::default()
        },
        registry,
        AdmissionController::new(AdmissionConfig::default()),
        executor,
        Arc::new(InMemoryTaskRepository::new()),
        events.clone(),
    );
    (orchestrator, events)
}

fn fast_sweeps() -> SupervisorConfig {
    SupervisorConfig {
        interval: Duration::from_millis(10),
        stuck_task_threshold: Duration::from_millis(50),
    }
}

#[test]
fn test_config_derives_from_scheduler() {
    let config = SupervisorConfig::from_config(&SchedulerConfig {
        task_timeout_ms: 1_500,
        supervisor_interval_ms: 250,
        ..SchedulerConfig::default()
    });
    assert_eq!(config.interval, Duration::from_millis(250));
    assert_eq!(config.stuck_task_threshold, Duration::from_millis(3_000));
}

#[tokio::test]
async fn test_sweep_fails_stuck_task_and_discards_its_result() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push(ScriptedStep::success().after(Duration::from_millis(300)));
    let (orchestrator, events) = setup(executor.clone());
    let supervisor = Supervisor::new(orchestrator.clone(), fast_sweeps());

    let worker = orchestrator
        .register_worker(WorkerSpec::new("ledger", 1))
        .await
        .unwrap();
    let id = orchestrator
        .submit_task(SubmitRequestBuilder::debit("acc-1", "10").build())
        .await
        .unwrap();

    assert!(supervisor.sweep().await.is_empty());
    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = supervisor.sweep().await;
    assert_eq!(report.stuck_tasks, vec![id]);
    assert!(report.expired_workers.is_empty());

    let task = orchestrator.wait_for_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.unwrap().contains("卡死"));
    assert_eq!(
        orchestrator.registry().snapshot(worker).await.unwrap().current_load,
        0
    );
    // 已强制失败的任务不会再次上报
    assert!(supervisor.sweep().await.stuck_tasks.is_empty());

    let discarded = || {
        let events = events.clone();
        async move { events.count("LateResultDiscarded") == 1 }
    };
    assert!(wait_for(discarded, Duration::from_secs(2)).await);
    assert_eq!(events.count("TaskCompleted"), 0);
    assert_eq!(orchestrator.stats().await.failed_today, 1);
}

#[tokio::test]
async fn test_supervisor_loop_runs_until_shutdown() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push(ScriptedStep::success().after(Duration::from_millis(500)));
    let (orchestrator, _) = setup(executor);
    let (shutdown_tx, _) = broadcast::channel(1);
    let supervisor = Supervisor::new(orchestrator.clone(), fast_sweeps());
    let handle = supervisor.spawn(shutdown_tx.subscribe());

    orchestrator
        .register_worker(WorkerSpec::new("ledger", 1))
        .await
        .unwrap();
    let id = orchestrator
        .submit_task(SubmitRequestBuilder::debit("acc-1", "10").build())
        .await
        .unwrap();

    let task = tokio::time::timeout(Duration::from_millis(400), orchestrator.wait_for_task(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_reports_expired_heartbeats() {
    let (orchestrator, events) = setup(Arc::new(ScriptedExecutor::new()));
    let supervisor = Supervisor::new(orchestrator.clone(), fast_sweeps());
    assert_eq!(supervisor.heartbeat_timeout(), Duration::from_secs(2));

    let silent = orchestrator
        .register_worker(WorkerSpec::new("ledger", 1))
        .await
        .unwrap();
    let alive = orchestrator
        .register_worker(WorkerSpec::new("ledger", 1))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(1_200)).await;
    orchestrator.heartbeat(alive).await.unwrap();
    tokio::time::advance(Duration::from_millis(1_200)).await;

    let report = supervisor.sweep().await;
    assert_eq!(report.expired_workers, vec![silent]);
    assert_eq!(events.count("WorkerRestartScheduled"), 1);

    let health = orchestrator.worker_health().await;
    assert_eq!(health.operational, 1);
    assert_eq!(health.failed, 1);
    let snapshot = orchestrator.registry().snapshot(silent).await.unwrap();
    assert_eq!(snapshot.health, WorkerHealth::Restarting);
}
