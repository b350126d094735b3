use std::time::Duration;

use thiserror::Error;

/// 编排核心统一错误类型
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("数据库操作失败: {0}")]
    Database(String),

    #[error("写入冲突: {0}")]
    WriteConflict(String),

    #[error("任务不存在: id={id}")]
    TaskNotFound { id: String },

    #[error("Worker不存在: id={id}")]
    WorkerNotFound { id: u64 },

    #[error("账户不存在: {id}")]
    AccountNotFound { id: String },

    #[error("账户已存在: {id}")]
    AccountAlreadyExists { id: String },

    #[error("任务参数无效: {0}")]
    InvalidTaskParams(String),

    #[error("业务规则校验失败[{rule}]: {message}")]
    RuleViolation { rule: String, message: String },

    #[error("余额不足: 账户={account}, 可用={available}, 请求={requested}")]
    InsufficientFunds {
        account: String,
        available: String,
        requested: String,
    },

    #[error("币种不匹配: 账户={account}, 账户币种={expected}, 请求币种={actual}")]
    CurrencyMismatch {
        account: String,
        expected: String,
        actual: String,
    },

    #[error("守恒校验失败: {0}")]
    ConservationViolated(String),

    #[error("任务执行超时: {0:?}")]
    ExecutionTimeout(Duration),

    #[error("任务卡死被强制失败: id={id}")]
    StuckTask { id: String },

    #[error("Worker执行失败: {0}")]
    WorkerFailure(String),

    #[error("重复请求对应的作业已失败[{job_id}]: {message}")]
    DuplicateFailed { job_id: String, message: String },

    #[error("准入等待超时")]
    AdmissionTimeout,

    #[error("准入被拒绝: {0}")]
    AdmissionRejected(String),

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("数据序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }
    pub fn write_conflict<S: Into<String>>(msg: S) -> Self {
        Self::WriteConflict(msg.into())
    }
    pub fn task_not_found<S: ToString>(id: S) -> Self {
        Self::TaskNotFound { id: id.to_string() }
    }
    pub fn worker_not_found(id: u64) -> Self {
        Self::WorkerNotFound { id }
    }
    pub fn account_not_found<S: ToString>(id: S) -> Self {
        Self::AccountNotFound { id: id.to_string() }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn rule_violation<R: Into<String>, M: Into<String>>(rule: R, message: M) -> Self {
        Self::RuleViolation {
            rule: rule.into(),
            message: message.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 执行核心内部可以立即重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::WriteConflict(_) | OrchestratorError::Database(_)
        )
    }

    /// 调度器层面是否值得重新排队重试
    pub fn is_retryable(&self) -> bool {
        !self.is_business_rejection()
            && !matches!(
                self,
                OrchestratorError::Configuration(_)
                    | OrchestratorError::AdmissionRejected(_)
                    | OrchestratorError::AdmissionTimeout
                    | OrchestratorError::InvalidStateTransition { .. }
                    | OrchestratorError::DuplicateFailed { .. }
            )
    }

    /// 是否计入Worker的熔断与健康统计
    pub fn counts_against_worker(&self) -> bool {
        !self.is_business_rejection()
            && !matches!(self, OrchestratorError::DuplicateFailed { .. })
    }

    /// 由请求内容本身决定的失败，重试不会改变结果，也不代表Worker故障
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InvalidTaskParams(_)
                | OrchestratorError::RuleViolation { .. }
                | OrchestratorError::InsufficientFunds { .. }
                | OrchestratorError::CurrencyMismatch { .. }
                | OrchestratorError::AccountNotFound { .. }
                | OrchestratorError::ConservationViolated(_)
        )
    }

    /// 指标与日志使用的错误分类
    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Database(_) => "database",
            OrchestratorError::WriteConflict(_) => "write_conflict",
            OrchestratorError::TaskNotFound { .. }
            | OrchestratorError::WorkerNotFound { .. }
            | OrchestratorError::AccountNotFound { .. } => "not_found",
            OrchestratorError::AccountAlreadyExists { .. } => "already_exists",
            OrchestratorError::InvalidTaskParams(_) => "invalid_params",
            OrchestratorError::RuleViolation { .. } => "rule_violation",
            OrchestratorError::InsufficientFunds { .. } => "insufficient_funds",
            OrchestratorError::CurrencyMismatch { .. } => "currency_mismatch",
            OrchestratorError::ConservationViolated(_) => "conservation",
            OrchestratorError::ExecutionTimeout(_) => "timeout",
            OrchestratorError::StuckTask { .. } => "stuck",
            OrchestratorError::WorkerFailure(_) => "worker_failure",
            OrchestratorError::DuplicateFailed { .. } => "duplicate_failed",
            OrchestratorError::AdmissionTimeout | OrchestratorError::AdmissionRejected(_) => {
                "admission"
            }
            OrchestratorError::InvalidStateTransition { .. } => "invalid_transition",
            OrchestratorError::Serialization(_) => "serialization",
            OrchestratorError::Configuration(_) => "configuration",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Internal(_) | OrchestratorError::Configuration(_)
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            OrchestratorError::TaskNotFound { .. } => "请求的任务不存在",
            OrchestratorError::WorkerNotFound { .. } => "请求的Worker节点不存在",
            OrchestratorError::AccountNotFound { .. } => "请求的账户不存在",
            OrchestratorError::InvalidTaskParams(_) => "任务参数配置有误",
            OrchestratorError::RuleViolation { .. } => "请求违反业务规则",
            OrchestratorError::InsufficientFunds { .. } => "账户余额不足",
            OrchestratorError::AdmissionTimeout => "系统繁忙，排队超时",
            OrchestratorError::AdmissionRejected(_) => "系统资源不足，请稍后重试",
            OrchestratorError::ExecutionTimeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_rejections_are_not_retryable() {
        let err = OrchestratorError::InsufficientFunds {
            account: "acc-1".into(),
            available: "50".into(),
            requested: "100".into(),
        };
        assert!(err.is_business_rejection());
        assert!(!err.is_retryable());
        assert!(!err.is_transient());

        let err = OrchestratorError::rule_violation("positive_amount", "金额必须大于0");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_errors() {
        assert!(OrchestratorError::write_conflict("version mismatch").is_transient());
        assert!(OrchestratorError::database_error("locked").is_transient());
        assert!(OrchestratorError::database_error("locked").is_retryable());
        assert!(!OrchestratorError::ExecutionTimeout(Duration::from_secs(1)).is_transient());
        assert!(OrchestratorError::ExecutionTimeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_admission_errors_are_distinguishable() {
        let timeout = OrchestratorError::AdmissionTimeout;
        let rejected = OrchestratorError::AdmissionRejected("等待队列已满".into());
        assert_ne!(timeout, rejected);
        assert_eq!(timeout.user_message(), "系统繁忙，排队超时");
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_duplicate_failure_settles_without_blaming_worker() {
        let err = OrchestratorError::DuplicateFailed {
            job_id: "job-1".into(),
            message: "余额不足".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.counts_against_worker());
        assert!(err.to_string().contains("余额不足"));
        assert!(OrchestratorError::WorkerFailure("reset".into()).counts_against_worker());
    }
}
