use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{
    CircuitBreakerConfig, CircuitState, OrchestratorError, RateLimitConfig, RegistryConfig,
};
use orchestrator_dispatcher::WorkerRegistry;
use orchestrator_domain::{WorkerHealth, WorkerId, WorkerSpec};
use orchestrator_testing_utils::RecordingEventSink;

fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 50,
        success_threshold: 1,
        backoff_multiplier: 2.0,
        max_reset_timeout_ms: 1_000,
    }
}

fn registry_config() -> RegistryConfig {
    RegistryConfig {
        heartbeat_interval_secs: 1,
        health_window: 10,
        health_min_samples: 5,
        restart_base_delay_ms: 100,
        restart_max_delay_ms: 1_000,
        default_breaker: CircuitBreakerConfig {
            failure_threshold: 100,
            ..fast_breaker()
        },
        ..RegistryConfig::default()
    }
}

fn setup(config: RegistryConfig) -> (WorkerRegistry, Arc<RecordingEventSink>) {
    let sink = Arc::new(RecordingEventSink::new());
    (WorkerRegistry::new(config, sink.clone()), sink)
}

fn no_pause() -> HashSet<String> {
    HashSet::new()
}

fn worker_error() -> OrchestratorError {
    OrchestratorError::WorkerFailure("connection reset".into())
}

#[tokio::test(start_paused = true)]
async fn test_register_assigns_sequential_ids() {
    let (registry, sink) = setup(registry_config());
    let first = registry.register(WorkerSpec::new("ledger", 2)).await.unwrap();
    let second = registry.register(WorkerSpec::new("ledger", 2)).await.unwrap();

    assert_eq!(first, WorkerId::new(1));
    assert_eq!(second, WorkerId::new(2));
    assert_eq!(registry.total_count().await, 2);
    assert_eq!(sink.count("WorkerRegistered"), 2);

    let err = registry
        .register(WorkerSpec::new("ledger", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Configuration(_)));
}

#[tokio::test(start_paused = true)]
async fn test_load_never_exceeds_capacity() {
    let (registry, _) = setup(registry_config());
    let id = registry.register(WorkerSpec::new("ledger", 2)).await.unwrap();

    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, Some(id));
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, Some(id));
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, None);
    assert_eq!(registry.snapshot(id).await.unwrap().current_load, 2);

    registry.release(id).await;
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, Some(id));
}

#[tokio::test(start_paused = true)]
async fn test_least_loaded_with_lowest_id_tie_break() {
    let (registry, _) = setup(registry_config());
    let a = registry.register(WorkerSpec::new("ledger", 2)).await.unwrap();
    let b = registry.register(WorkerSpec::new("ledger", 2)).await.unwrap();

    let picks: Vec<Option<WorkerId>> = {
        let mut picks = Vec::new();
        for _ in 0..5 {
            picks.push(registry.pick_least_loaded(None, &no_pause()).await);
        }
        picks
    };
    assert_eq!(picks, vec![Some(a), Some(b), Some(a), Some(b), None]);
}

#[tokio::test(start_paused = true)]
async fn test_type_filter_and_paused_categories() {
    let (registry, _) = setup(registry_config());
    let ledger = registry.register(WorkerSpec::new("ledger", 4)).await.unwrap();
    let reporting = registry.register(WorkerSpec::new("reporting", 4)).await.unwrap();

    assert_eq!(
        registry.pick_least_loaded(Some("reporting"), &no_pause()).await,
        Some(reporting)
    );
    assert_eq!(registry.pick_least_loaded(Some("archive"), &no_pause()).await, None);

    let paused: HashSet<String> = ["reporting".to_string()].into_iter().collect();
    assert_eq!(registry.pick_least_loaded(Some("reporting"), &paused).await, None);
    assert_eq!(registry.pick_least_loaded(None, &paused).await, Some(ledger));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_refuses_without_tripping_breaker() {
    let (registry, _) = setup(registry_config());
    let spec = WorkerSpec::new("ledger", 10).with_rate_limit(RateLimitConfig {
        max_per_window: 2,
        window_secs: 60,
    });
    let id = registry.register(spec).await.unwrap();

    assert!(registry.pick_least_loaded(None, &no_pause()).await.is_some());
    assert!(registry.pick_least_loaded(None, &no_pause()).await.is_some());
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, None);
    assert!(!registry.is_available(id).await);

    let snapshot = registry.snapshot(id).await.unwrap();
    assert_eq!(snapshot.circuit_state, CircuitState::Closed);
    assert_eq!(snapshot.health, WorkerHealth::Operational);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, Some(id));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_half_opens_and_closes() {
    let (registry, sink) = setup(registry_config());
    let id = registry
        .register(WorkerSpec::new("ledger", 4).with_breaker(fast_breaker()))
        .await
        .unwrap();

    registry.record_failure(id, &worker_error()).await;
    assert!(registry.is_available(id).await);
    registry.record_failure(id, &worker_error()).await;
    assert!(!registry.is_available(id).await);
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, None);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        registry.snapshot(id).await.unwrap().circuit_state,
        CircuitState::HalfOpen
    );

    // 半开状态只放行一个试探请求
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, Some(id));
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, None);

    registry.release(id).await;
    registry.record_success(id, Duration::from_millis(5)).await;
    assert_eq!(
        registry.snapshot(id).await.unwrap().circuit_state,
        CircuitState::Closed
    );
    assert_eq!(
        sink.breaker_transitions(id),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_with_longer_timeout() {
    let (registry, sink) = setup(registry_config());
    let id = registry
        .register(WorkerSpec::new("ledger", 4).with_breaker(fast_breaker()))
        .await
        .unwrap();
    registry.record_failure(id, &worker_error()).await;
    registry.record_failure(id, &worker_error()).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, Some(id));
    registry.release(id).await;
    registry.record_failure(id, &worker_error()).await;
    assert_eq!(
        registry.snapshot(id).await.unwrap().circuit_state,
        CircuitState::Open
    );

    // 退避后的重置超时为100ms
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        registry.snapshot(id).await.unwrap().circuit_state,
        CircuitState::Open
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        registry.snapshot(id).await.unwrap().circuit_state,
        CircuitState::HalfOpen
    );
    assert_eq!(sink.breaker_transitions(id).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_health_degrades_then_fails_and_restarts() {
    let (registry, sink) = setup(registry_config());
    let id = registry.register(WorkerSpec::new("ledger", 4)).await.unwrap();

    for _ in 0..4 {
        registry.record_success(id, Duration::from_millis(10)).await;
    }
    registry.record_failure(id, &worker_error()).await;
    assert_eq!(registry.snapshot(id).await.unwrap().health, WorkerHealth::Degraded);
    assert!(registry.is_available(id).await);

    for _ in 0..3 {
        registry.record_failure(id, &worker_error()).await;
    }
    // 4/8 = 50%，尚未超过失效阈值
    assert_eq!(registry.snapshot(id).await.unwrap().health, WorkerHealth::Degraded);

    registry.record_failure(id, &worker_error()).await;
    let snapshot = registry.snapshot(id).await.unwrap();
    assert_eq!(snapshot.health, WorkerHealth::Restarting);
    assert_eq!(snapshot.restart_attempts, 1);
    assert!(!snapshot.available);
    assert_eq!(sink.count("WorkerRestartScheduled"), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = registry.snapshot(id).await.unwrap();
    assert_eq!(snapshot.health, WorkerHealth::Operational);
    assert_eq!(snapshot.error_rate, 0.0);
    assert_eq!(sink.count("WorkerRestarted"), 1);
    assert!(registry.is_available(id).await);
}

#[tokio::test(start_paused = true)]
async fn test_restart_attempts_are_bounded() {
    let config = RegistryConfig {
        max_restart_attempts: 1,
        ..registry_config()
    };
    let (registry, sink) = setup(config);
    let id = registry.register(WorkerSpec::new("ledger", 4)).await.unwrap();

    for _ in 0..5 {
        registry.record_failure(id, &worker_error()).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(registry.snapshot(id).await.unwrap().health, WorkerHealth::Operational);

    for _ in 0..5 {
        registry.record_failure(id, &worker_error()).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshot = registry.snapshot(id).await.unwrap();
    assert_eq!(snapshot.health, WorkerHealth::Failed);
    assert_eq!(snapshot.restart_attempts, 1);
    assert_eq!(sink.count("WorkerRestartExhausted"), 1);
    assert_eq!(registry.pick_least_loaded(None, &no_pause()).await, None);

    let summary = registry.health_summary().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.health_score, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_marks_worker_failed() {
    let (registry, sink) = setup(registry_config());
    let quiet = registry.register(WorkerSpec::new("ledger", 1)).await.unwrap();
    let chatty = registry.register(WorkerSpec::new("ledger", 1)).await.unwrap();

    tokio::time::advance(Duration::from_millis(1_500)).await;
    registry.heartbeat(chatty).await.unwrap();
    assert!(registry.check_heartbeats().await.is_empty());

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert_eq!(registry.check_heartbeats().await, vec![quiet]);
    assert_eq!(
        registry.snapshot(quiet).await.unwrap().health,
        WorkerHealth::Restarting
    );
    assert_eq!(
        registry.snapshot(chatty).await.unwrap().health,
        WorkerHealth::Operational
    );
    // 已处理的Worker不会重复上报
    assert!(registry.check_heartbeats().await.is_empty());
    assert_eq!(sink.count("WorkerRestartScheduled"), 1);

    let err = registry.heartbeat(WorkerId::new(99)).await.unwrap_err();
    assert_eq!(err, OrchestratorError::worker_not_found(99));
}
