use chrono::{DateTime, Utc};
use orchestrator_core::{CircuitBreakerConfig, CircuitState, RateLimitConfig};
use serde::{Deserialize, Serialize};

use crate::value_objects::WorkerId;

/// Worker健康分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerHealth {
    Operational,
    Degraded,
    Failed,
    /// 已失效，等待退避后自动重启
    Restarting,
}

impl WorkerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerHealth::Operational => "OPERATIONAL",
            WorkerHealth::Degraded => "DEGRADED",
            WorkerHealth::Failed => "FAILED",
            WorkerHealth::Restarting => "RESTARTING",
        }
    }

    /// 可以接收新任务的健康状态
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerHealth::Operational | WorkerHealth::Degraded)
    }
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册Worker的规格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker_type: String,
    pub capacity: u32,
    /// 为空时使用注册表默认配置
    pub breaker: Option<CircuitBreakerConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl WorkerSpec {
    pub fn new<S: Into<String>>(worker_type: S, capacity: u32) -> Self {
        Self {
            worker_type: worker_type.into(),
            capacity,
            breaker: None,
            rate_limit: None,
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

/// Worker状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub worker_type: String,
    pub capacity: u32,
    pub current_load: u32,
    pub health: WorkerHealth,
    pub circuit_state: CircuitState,
    pub available: bool,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub restart_attempts: u32,
    pub millis_since_heartbeat: u64,
    pub registered_at: DateTime<Utc>,
}

impl WorkerSnapshot {
    pub fn load_percentage(&self) -> f64 {
        if self.capacity == 0 {
            return 100.0;
        }
        f64::from(self.current_load) / f64::from(self.capacity) * 100.0
    }
}

/// Worker健康汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthSummary {
    pub operational: usize,
    pub degraded: usize,
    /// 包含重启中的Worker
    pub failed: usize,
    /// 0-100，降级按一半计
    pub health_score: f64,
}

impl WorkerHealthSummary {
    pub fn from_snapshots(workers: &[WorkerSnapshot]) -> Self {
        let operational = workers
            .iter()
            .filter(|w| w.health == WorkerHealth::Operational)
            .count();
        let degraded = workers
            .iter()
            .filter(|w| w.health == WorkerHealth::Degraded)
            .count();
        let failed = workers.len() - operational - degraded;
        let health_score = if workers.is_empty() {
            100.0
        } else {
            (operational as f64 + degraded as f64 * 0.5) / workers.len() as f64 * 100.0
        };
        Self {
            operational,
            degraded,
            failed,
            health_score,
        }
    }
}

/// 调度器统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_workers: usize,
    pub available_workers: usize,
    pub pending: usize,
    pub running: usize,
    pub completed_today: u64,
    pub failed_today: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64, health: WorkerHealth) -> WorkerSnapshot {
        WorkerSnapshot {
            id: WorkerId::new(id),
            worker_type: "ledger".into(),
            capacity: 2,
            current_load: 1,
            health,
            circuit_state: CircuitState::Closed,
            available: true,
            error_rate: 0.0,
            avg_latency_ms: 0.0,
            restart_attempts: 0,
            millis_since_heartbeat: 0,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_health_summary_score() {
        let workers = vec![
            snapshot(1, WorkerHealth::Operational),
            snapshot(2, WorkerHealth::Degraded),
            snapshot(3, WorkerHealth::Failed),
            snapshot(4, WorkerHealth::Restarting),
        ];
        let summary = WorkerHealthSummary::from_snapshots(&workers);
        assert_eq!(summary.operational, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.failed, 2);
        assert!((summary.health_score - 37.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_pool_is_healthy() {
        let summary = WorkerHealthSummary::from_snapshots(&[]);
        assert_eq!(summary.health_score, 100.0);
        assert_eq!(snapshot(1, WorkerHealth::Operational).load_percentage(), 50.0);
    }
}
