use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{AdmissionConfig, DegradationConfig, OrchestratorError};
use orchestrator_dispatcher::{
    AdmissionController, AdmissionDecision, AdmissionPermit, AdmissionTicket,
};
use orchestrator_domain::{ResourceSnapshot, TaskPriority};
use orchestrator_testing_utils::{wait_for, StaticMetricsSource};
use tokio::sync::broadcast;

fn config(max_in_flight: usize, max_queue_size: usize) -> AdmissionConfig {
    AdmissionConfig {
        max_in_flight,
        max_queue_size,
        queue_timeout_ms: 1_000,
        cpu_threshold_percent: 90.0,
        memory_threshold_percent: 90.0,
        sample_interval_ms: 10,
        degradation: DegradationConfig::default(),
    }
}

fn proceed(decision: AdmissionDecision) -> AdmissionPermit {
    match decision {
        AdmissionDecision::Proceed(permit) => permit,
        other => panic!("expected proceed, got {}", other.as_str()),
    }
}

fn queued(decision: AdmissionDecision) -> AdmissionTicket {
    match decision {
        AdmissionDecision::Queued(ticket) => ticket,
        other => panic!("expected queued, got {}", other.as_str()),
    }
}

#[tokio::test]
async fn test_proceeds_under_ceiling_then_queues() {
    let controller = AdmissionController::new(config(2, 4));
    let first = proceed(controller.admit(TaskPriority::Medium));
    let _second = proceed(controller.admit(TaskPriority::Medium));
    assert_eq!(controller.in_flight(), 2);

    let ticket = queued(controller.admit(TaskPriority::Medium));
    assert_eq!(controller.waiting(), 1);

    drop(first);
    let _third = ticket.wait().await.unwrap();
    assert_eq!(controller.in_flight(), 2);
    assert_eq!(controller.waiting(), 0);
}

#[tokio::test]
async fn test_waiters_are_served_by_priority() {
    let controller = AdmissionController::new(config(1, 4));
    let permit = proceed(controller.admit(TaskPriority::Medium));
    let low = queued(controller.admit(TaskPriority::Low));
    let critical = queued(controller.admit(TaskPriority::Critical));
    assert_eq!(critical.priority(), TaskPriority::Critical);

    drop(permit);
    let critical_permit = critical.wait().await.unwrap();
    assert_eq!(controller.waiting(), 1);

    drop(critical_permit);
    let _low_permit = low.wait().await.unwrap();
    assert_eq!(controller.in_flight(), 1);
}

#[tokio::test]
async fn test_full_queue_rejects() {
    let controller = AdmissionController::new(config(1, 1));
    let _permit = proceed(controller.admit(TaskPriority::High));
    let _ticket = queued(controller.admit(TaskPriority::High));

    let decision = controller.admit(TaskPriority::Critical);
    assert_eq!(decision.as_str(), "rejected");
    let err = decision.into_permit().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AdmissionRejected(_)));
}

#[tokio::test]
async fn test_queue_timeout_is_distinct_error() {
    let controller = AdmissionController::new(AdmissionConfig {
        queue_timeout_ms: 30,
        ..config(1, 4)
    });
    let _permit = proceed(controller.admit(TaskPriority::Medium));

    let err = controller
        .admit(TaskPriority::Medium)
        .into_permit()
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::AdmissionTimeout);
    assert_eq!(controller.waiting(), 0);
    assert_eq!(controller.in_flight(), 1);
}

#[tokio::test]
async fn test_pressure_pauses_admission_and_draining() {
    let controller = AdmissionController::new(config(2, 4));
    let permit = proceed(controller.admit(TaskPriority::Medium));

    controller.update_metrics(ResourceSnapshot::new(95.0, 40.0, 10));
    assert!(controller.is_throttled());

    let ticket = queued(controller.admit(TaskPriority::Critical));
    drop(permit);
    // 压力未解除时释放名额也不出队
    assert_eq!(controller.in_flight(), 0);
    assert_eq!(controller.waiting(), 1);

    controller.update_metrics(ResourceSnapshot::new(20.0, 40.0, 10));
    assert!(!controller.is_throttled());
    let _permit = ticket.wait().await.unwrap();
    assert_eq!(controller.in_flight(), 1);
    assert_eq!(controller.last_snapshot().map(|s| s.cpu_percent), Some(20.0));
}

#[tokio::test]
async fn test_memory_pressure_also_throttles() {
    let controller = AdmissionController::new(config(2, 4));
    controller.update_metrics(ResourceSnapshot::new(10.0, 91.0, 10));
    assert!(controller.is_throttled());
    assert_eq!(controller.admit(TaskPriority::Low).as_str(), "queued");
}

#[tokio::test]
async fn test_degradation_pauses_non_critical_but_never_exempt() {
    let controller = AdmissionController::new(AdmissionConfig {
        degradation: DegradationConfig {
            enabled: true,
            non_critical_categories: vec!["reporting".to_string(), "ledger".to_string()],
            exempt_categories: vec!["ledger".to_string()],
            active_caller_floor: 5,
        },
        ..config(4, 4)
    });

    controller.update_metrics(ResourceSnapshot::new(10.0, 10.0, 2));
    let expected: HashSet<String> = ["reporting".to_string()].into_iter().collect();
    assert_eq!(controller.paused_categories(), expected);
    assert!(controller.is_category_paused("reporting"));
    assert!(!controller.is_category_paused("ledger"));

    controller.update_metrics(ResourceSnapshot::new(10.0, 10.0, 5));
    assert!(controller.paused_categories().is_empty());
}

#[tokio::test]
async fn test_degradation_disabled_pauses_nothing() {
    let controller = AdmissionController::new(AdmissionConfig {
        degradation: DegradationConfig {
            enabled: false,
            non_critical_categories: vec!["reporting".to_string()],
            exempt_categories: Vec::new(),
            active_caller_floor: 5,
        },
        ..config(4, 4)
    });
    controller.update_metrics(ResourceSnapshot::new(10.0, 10.0, 0));
    assert!(controller.paused_categories().is_empty());
}

#[tokio::test]
async fn test_sampler_follows_metrics_source() {
    let controller = AdmissionController::new(config(4, 4));
    let source = Arc::new(StaticMetricsSource::new());
    let (shutdown_tx, _) = broadcast::channel(1);

    let sampler = {
        let controller = controller.clone();
        let source = source.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { controller.run_sampler(source, shutdown).await })
    };

    source.set(97.0, 10.0, 10);
    let throttled = || {
        let controller = controller.clone();
        async move { controller.is_throttled() }
    };
    assert!(wait_for(throttled, Duration::from_secs(1)).await);

    // 采样失败时保持上一次状态
    source.set_failing(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.is_throttled());

    source.set_failing(false);
    source.set(10.0, 10.0, 10);
    let relieved = || {
        let controller = controller.clone();
        async move { !controller.is_throttled() }
    };
    assert!(wait_for(relieved, Duration::from_secs(1)).await);

    shutdown_tx.send(()).unwrap();
    sampler.await.unwrap();
}
