//! 执行记录与执行结果

use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorError;
use serde::{Deserialize, Serialize};

use crate::payload::TaskKind;
use crate::value_objects::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "IN_PROGRESS",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    /// 去重时仍然有效的记录：进行中或已成功
    pub fn blocks_duplicates(&self) -> bool {
        matches!(self, ExecutionStatus::InProgress | ExecutionStatus::Succeeded)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(ExecutionStatus::InProgress),
            "SUCCEEDED" => Ok(ExecutionStatus::Succeeded),
            "FAILED" => Ok(ExecutionStatus::Failed),
            _ => Err(OrchestratorError::Serialization(format!(
                "无效的执行状态: {s}"
            ))),
        }
    }
}

/// 一次逻辑操作的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    /// 由 (类型, 负载) 计算的内容哈希
    pub idempotency_key: String,
    pub kind: TaskKind,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn in_progress(idempotency_key: String, kind: TaskKind) -> Self {
        Self {
            job_id: JobId::new(),
            idempotency_key,
            kind,
            status: ExecutionStatus::InProgress,
            result: None,
            error: None,
            warnings: Vec::new(),
            attempts: 0,
            duration_ms: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn succeed(&mut self, result: serde_json::Value, duration_ms: u64) {
        self.status = ExecutionStatus::Succeeded;
        self.result = Some(result);
        self.error = None;
        self.duration_ms = duration_ms;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &OrchestratorError, duration_ms: u64) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.to_string());
        self.duration_ms = duration_ms;
        self.completed_at = Some(Utc::now());
    }
}

/// 去重认领结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// 新记录已写入，调用方负责执行
    Claimed,
    /// 窗口内已有进行中或已成功的记录
    Existing(ExecutionRecord),
}

/// 单次执行选项
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// 跳过去重检查（仍然写入执行记录）
    pub skip_dedup: bool,
    /// 覆盖执行层最大尝试次数
    pub max_attempts: Option<u32>,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 是否命中已有记录而未重新执行
    pub duplicate: bool,
    pub warnings: Vec<String>,
}

impl ExecutionOutcome {
    pub fn from_record(record: &ExecutionRecord, duplicate: bool) -> Self {
        Self {
            job_id: record.job_id,
            status: record.status,
            result: record.result.clone(),
            error: record.error.clone(),
            duplicate,
            warnings: record.warnings.clone(),
        }
    }

    /// 只有已成功的记录算作成功，进行中的记录不是终态
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// 同类任务的历史统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInsight {
    pub kind: TaskKind,
    pub samples: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

impl ExecutionInsight {
    pub fn from_records(kind: TaskKind, records: &[ExecutionRecord]) -> Self {
        let finished: Vec<&ExecutionRecord> = records
            .iter()
            .filter(|r| r.status != ExecutionStatus::InProgress)
            .collect();
        if finished.is_empty() {
            return Self {
                kind,
                samples: 0,
                success_rate: 0.0,
                avg_duration_ms: 0.0,
            };
        }
        let succeeded = finished
            .iter()
            .filter(|r| r.status == ExecutionStatus::Succeeded)
            .count();
        let total_ms: u64 = finished.iter().map(|r| r.duration_ms).sum();
        Self {
            kind,
            samples: finished.len(),
            success_rate: succeeded as f64 / finished.len() as f64,
            avg_duration_ms: total_ms as f64 / finished.len() as f64,
        }
    }
}
