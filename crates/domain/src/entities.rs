use chrono::{DateTime, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use crate::payload::{TaskKind, TaskPayload};
use crate::value_objects::{JobId, TaskId, WorkerId};

/// 任务优先级，`Critical > High > Medium > Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::High => "HIGH",
            TaskPriority::Critical => "CRITICAL",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOW" => Ok(TaskPriority::Low),
            "MEDIUM" => Ok(TaskPriority::Medium),
            "HIGH" => Ok(TaskPriority::High),
            "CRITICAL" => Ok(TaskPriority::Critical),
            _ => Err(OrchestratorError::invalid_params(format!(
                "无效的任务优先级: {s}"
            ))),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Failed)
                | (Assigned, Running)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Assigned, Retrying)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Assigned)
                | (Retrying, Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "ASSIGNED" => Ok(TaskStatus::Assigned),
            "RUNNING" => Ok(TaskStatus::Running),
            "RETRYING" => Ok(TaskStatus::Retrying),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(OrchestratorError::Serialization(format!(
                "无效的任务状态: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    /// 到达序号，同优先级内先到先服务
    pub sequence: u64,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub required_worker_type: Option<String>,
    pub assigned_worker: Option<WorkerId>,
    pub job_id: Option<JobId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        payload: TaskPayload,
        priority: TaskPriority,
        sequence: u64,
        required_worker_type: Option<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            kind: payload.kind(),
            payload,
            priority,
            sequence,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            required_worker_type,
            assigned_worker: None,
            job_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// 状态转换。终态不可变更
    pub fn transition_to(&mut self, next: TaskStatus) -> OrchestratorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// 提交任务请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: TaskPriority,
    /// 指定Worker类型，缺省时任意类型均可
    #[serde(default)]
    pub required_worker_type: Option<String>,
    /// 缺省时使用调度器配置的默认值
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitTaskRequest {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: TaskPriority::default(),
            required_worker_type: None,
            max_retries: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::DebitRequest;
    use crate::value_objects::AccountId;
    use bigdecimal::BigDecimal;

    fn task() -> Task {
        Task::new(
            TaskPayload::PaymentProcessing(DebitRequest {
                account_id: AccountId::new("acc-1"),
                amount: BigDecimal::from(1),
                currency: "USD".to_string(),
                reference: None,
            }),
            TaskPriority::High,
            1,
            None,
            3,
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut t = task();
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        t.transition_to(TaskStatus::Retrying).unwrap();
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Completed).unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut t = task();
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Failed).unwrap();
        for next in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Completed,
        ] {
            assert!(t.transition_to(next).is_err());
        }
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn test_pending_cannot_skip_to_running() {
        let mut t = task();
        assert!(matches!(
            t.transition_to(TaskStatus::Running),
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
    }
}
