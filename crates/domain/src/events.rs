//! 生命周期事件
//!
//! 熔断转换、任务生命周期和账本回滚都以 [`LifecycleEvent`] 的形式交给 [`EventSink`]。
//! 投递约定：发布方在状态转换完成后同步调用 `publish`，每次转换恰好一次，
//! 同一发布方的事件按发生顺序到达。实现不得阻塞。

use chrono::{DateTime, Utc};
use orchestrator_core::CircuitState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::TaskPriority;
use crate::payload::TaskKind;
use crate::value_objects::{JobId, TaskId, WorkerId};
use crate::worker::WorkerHealth;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    WorkerRegistered {
        worker_id: WorkerId,
        worker_type: String,
        capacity: u32,
    },
    BreakerTransition {
        worker_id: WorkerId,
        from: CircuitState,
        to: CircuitState,
    },
    WorkerHealthChanged {
        worker_id: WorkerId,
        from: WorkerHealth,
        to: WorkerHealth,
        reason: String,
    },
    WorkerRestartScheduled {
        worker_id: WorkerId,
        attempt: u32,
        delay_ms: u64,
    },
    WorkerRestarted {
        worker_id: WorkerId,
        attempt: u32,
    },
    WorkerRestartExhausted {
        worker_id: WorkerId,
        attempts: u32,
    },
    TaskSubmitted {
        task_id: TaskId,
        kind: TaskKind,
        priority: TaskPriority,
    },
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        job_id: JobId,
        duplicate: bool,
    },
    TaskRetrying {
        task_id: TaskId,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        retry_count: u32,
        error: String,
    },
    LateResultDiscarded {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    LedgerRolledBack {
        job_id: JobId,
        operation_id: Uuid,
        reason: String,
    },
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::WorkerRegistered { .. } => "WorkerRegistered",
            LifecycleEvent::BreakerTransition { .. } => "BreakerTransition",
            LifecycleEvent::WorkerHealthChanged { .. } => "WorkerHealthChanged",
            LifecycleEvent::WorkerRestartScheduled { .. } => "WorkerRestartScheduled",
            LifecycleEvent::WorkerRestarted { .. } => "WorkerRestarted",
            LifecycleEvent::WorkerRestartExhausted { .. } => "WorkerRestartExhausted",
            LifecycleEvent::TaskSubmitted { .. } => "TaskSubmitted",
            LifecycleEvent::TaskAssigned { .. } => "TaskAssigned",
            LifecycleEvent::TaskCompleted { .. } => "TaskCompleted",
            LifecycleEvent::TaskRetrying { .. } => "TaskRetrying",
            LifecycleEvent::TaskFailed { .. } => "TaskFailed",
            LifecycleEvent::LateResultDiscarded { .. } => "LateResultDiscarded",
            LifecycleEvent::LedgerRolledBack { .. } => "LedgerRolledBack",
        }
    }

    /// 事件所属聚合的标识
    pub fn aggregate_id(&self) -> String {
        match self {
            LifecycleEvent::WorkerRegistered { worker_id, .. }
            | LifecycleEvent::BreakerTransition { worker_id, .. }
            | LifecycleEvent::WorkerHealthChanged { worker_id, .. }
            | LifecycleEvent::WorkerRestartScheduled { worker_id, .. }
            | LifecycleEvent::WorkerRestarted { worker_id, .. }
            | LifecycleEvent::WorkerRestartExhausted { worker_id, .. } => worker_id.to_string(),
            LifecycleEvent::TaskSubmitted { task_id, .. }
            | LifecycleEvent::TaskAssigned { task_id, .. }
            | LifecycleEvent::TaskCompleted { task_id, .. }
            | LifecycleEvent::TaskRetrying { task_id, .. }
            | LifecycleEvent::TaskFailed { task_id, .. }
            | LifecycleEvent::LateResultDiscarded { task_id, .. } => task_id.to_string(),
            LifecycleEvent::LedgerRolledBack { job_id, .. } => job_id.to_string(),
        }
    }
}

/// 带元数据的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: LifecycleEvent,
}

impl EventEnvelope {
    pub fn new(event: LifecycleEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
        }
    }
}

/// 审计/事件接收端
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LifecycleEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: LifecycleEvent) {}
}
