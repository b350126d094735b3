//! Metrics collector for the orchestration core
//!
//! Thin wrapper over the `metrics` facade. Without an installed recorder
//! every call is a no-op, so components can record unconditionally.

use metrics::{counter, gauge, histogram};

#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    // Task lifecycle metrics

    pub fn record_task_submitted(&self, kind: &str, priority: &str) {
        counter!(
            "orchestrator_tasks_submitted_total",
            "kind" => kind.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    pub fn record_task_completed(&self, kind: &str, duration_seconds: f64) {
        counter!("orchestrator_tasks_completed_total", "kind" => kind.to_string()).increment(1);
        histogram!("orchestrator_task_duration_seconds", "kind" => kind.to_string())
            .record(duration_seconds);
    }

    pub fn record_task_failed(&self, kind: &str, error_type: &str) {
        counter!(
            "orchestrator_tasks_failed_total",
            "kind" => kind.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    pub fn record_task_retry(&self, kind: &str) {
        counter!("orchestrator_task_retries_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_late_result(&self) {
        counter!("orchestrator_late_results_discarded_total").increment(1);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        gauge!("orchestrator_queue_depth").set(depth as f64);
    }

    pub fn set_running_tasks(&self, running: usize) {
        gauge!("orchestrator_running_tasks").set(running as f64);
    }

    // Worker metrics

    pub fn set_available_workers(&self, count: usize) {
        gauge!("orchestrator_available_workers").set(count as f64);
    }

    pub fn record_breaker_transition(&self, to: &str) {
        counter!("orchestrator_breaker_transitions_total", "to" => to.to_string()).increment(1);
    }

    pub fn record_worker_restart(&self, outcome: &str) {
        counter!("orchestrator_worker_restarts_total", "outcome" => outcome.to_string())
            .increment(1);
    }

    // Admission metrics

    pub fn record_admission(&self, decision: &str) {
        counter!("orchestrator_admission_decisions_total", "decision" => decision.to_string())
            .increment(1);
    }

    pub fn set_admission_waiters(&self, waiters: usize) {
        gauge!("orchestrator_admission_waiters").set(waiters as f64);
    }

    // Execution metrics

    pub fn record_execution(&self, kind: &str, status: &str, duration_seconds: f64) {
        counter!(
            "orchestrator_executions_total",
            "kind" => kind.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!("orchestrator_execution_duration_seconds", "kind" => kind.to_string())
            .record(duration_seconds);
    }

    pub fn record_duplicate(&self, kind: &str) {
        counter!("orchestrator_execution_duplicates_total", "kind" => kind.to_string())
            .increment(1);
    }

    pub fn record_ledger_commit(&self, kind: &str) {
        counter!("orchestrator_ledger_commits_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_ledger_rollback(&self, kind: &str) {
        counter!("orchestrator_ledger_rollbacks_total", "kind" => kind.to_string()).increment(1);
    }
}
