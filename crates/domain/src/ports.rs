//! 外部协作方接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use serde::{Deserialize, Serialize};

use crate::entities::Task;
use crate::execution::ExecutionOutcome;
use crate::payload::TaskPayload;

/// 资源压力快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_connections: usize,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f64, memory_percent: f64, active_connections: usize) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            active_connections,
            taken_at: Utc::now(),
        }
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0, 0)
    }
}

/// 资源指标来源
#[async_trait]
pub trait ResourceMetricsSource: Send + Sync {
    async fn snapshot(&self) -> OrchestratorResult<ResourceSnapshot>;
}

/// 任务执行器，调度器在分配后调用
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 提交时的同步预检，失败的任务不会入队
    fn precheck(&self, payload: &TaskPayload) -> OrchestratorResult<()> {
        payload.validate()
    }

    async fn execute(&self, task: &Task) -> OrchestratorResult<ExecutionOutcome>;
}
