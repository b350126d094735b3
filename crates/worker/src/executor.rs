use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::{ExecutionConfig, OrchestratorError, OrchestratorResult};
use orchestrator_domain::{
    ClaimOutcome, ExecuteOptions, ExecutionInsight, ExecutionOutcome, ExecutionRecord,
    ExecutionRecordRepository, ExecutionStatus, JobId, Task, TaskExecutor, TaskKind, TaskPayload,
};
use orchestrator_infrastructure::MetricsCollector;
use tracing::{debug, error, info, instrument, warn};

use crate::hashing::idempotency_key;
use crate::ledger::LedgerService;
use crate::rules::RuleEngine;

/// 执行核心
///
/// 执行顺序：内容哈希 → 去重认领 → 结构与业务规则校验 → 带有限重试的账本提交 →
/// 写回执行记录。认领之后无论成功与否都会写回记录。
///
/// 命中进行中的同键记录时，等待原始作业结束并以它的终态作为本次结果。
pub struct ExecutionCore {
    config: ExecutionConfig,
    records: Arc<dyn ExecutionRecordRepository>,
    ledger: Arc<LedgerService>,
    rules: RuleEngine,
    metrics: MetricsCollector,
}

impl ExecutionCore {
    pub fn new(
        config: ExecutionConfig,
        records: Arc<dyn ExecutionRecordRepository>,
        ledger: Arc<LedgerService>,
    ) -> OrchestratorResult<Self> {
        let rules = RuleEngine::from_config(&config.rules, ledger.precision())?;
        Ok(Self::with_rules(config, records, ledger, rules))
    }

    pub fn with_rules(
        config: ExecutionConfig,
        records: Arc<dyn ExecutionRecordRepository>,
        ledger: Arc<LedgerService>,
        rules: RuleEngine,
    ) -> Self {
        Self {
            config,
            records,
            ledger,
            rules,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    #[instrument(skip_all, fields(kind = %payload.kind()))]
    pub async fn execute(
        &self,
        payload: &TaskPayload,
        options: ExecuteOptions,
    ) -> OrchestratorResult<ExecutionOutcome> {
        let kind = payload.kind();
        let precision = self.ledger.precision();
        let key = idempotency_key(payload, &precision)?;
        let mut record = ExecutionRecord::in_progress(key, kind);

        if options.skip_dedup {
            self.records.update(&record).await?;
        } else {
            let since = Utc::now() - chrono::Duration::seconds(self.config.dedup_window_secs as i64);
            if let ClaimOutcome::Existing(existing) = self.records.claim(&record, since).await? {
                info!(
                    job_id = %existing.job_id,
                    status = existing.status.as_str(),
                    "重复请求，返回已有执行记录"
                );
                self.metrics.record_duplicate(kind.as_str());
                let settled = if existing.status == ExecutionStatus::InProgress {
                    self.await_settled(existing.job_id).await?
                } else {
                    existing
                };
                return settle_duplicate(settled);
            }
        }

        self.log_recall(kind).await;

        let started = Instant::now();
        let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let result = self
            .run(record.job_id, payload, max_attempts, &mut record)
            .await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        match &result {
            Ok(value) => record.succeed(value.clone(), duration_ms),
            Err(e) => record.fail(e, duration_ms),
        }
        self.metrics
            .record_execution(kind.as_str(), record.status.as_str(), elapsed.as_secs_f64());

        if let Err(persist_error) = self.records.update(&record).await {
            // 账本变更已生效，结果仍按执行结果返回
            error!(job_id = %record.job_id, error = %persist_error, "写回执行记录失败");
        }

        match result {
            Ok(_) => {
                debug!(job_id = %record.job_id, attempts = record.attempts, "执行成功");
                Ok(ExecutionOutcome::from_record(&record, false))
            }
            Err(e) => {
                warn!(job_id = %record.job_id, attempts = record.attempts, error = %e, "执行失败");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        job_id: JobId,
        payload: &TaskPayload,
        max_attempts: u32,
        record: &mut ExecutionRecord,
    ) -> OrchestratorResult<serde_json::Value> {
        payload.validate()?;
        record.warnings = self.rules.evaluate(payload)?;
        for warning in &record.warnings {
            warn!(job_id = %job_id, warning = %warning, "业务规则警告");
        }

        let normalized = payload.normalized(&self.ledger.precision());
        let mut attempt = 0;
        loop {
            attempt += 1;
            record.attempts = attempt;
            match self.ledger.apply(job_id, &normalized).await {
                Ok(operation) => return Ok(serde_json::to_value(&operation)?),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        job_id = %job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "瞬时错误，稍后重试"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_settled(&self, job_id: JobId) -> OrchestratorResult<ExecutionRecord> {
        let wait = self.config.inflight_wait();
        debug!(job_id = %job_id, wait_ms = wait.as_millis() as u64, "等待进行中的原始作业结束");
        match tokio::time::timeout(wait, self.poll_until_settled(job_id)).await {
            Ok(settled) => settled,
            Err(_) => {
                warn!(job_id = %job_id, "原始作业在等待期限内未结束");
                Err(OrchestratorError::ExecutionTimeout(wait))
            }
        }
    }

    async fn poll_until_settled(&self, job_id: JobId) -> OrchestratorResult<ExecutionRecord> {
        let mut ticker = tokio::time::interval(self.config.inflight_poll_interval());
        loop {
            ticker.tick().await;
            match self.records.find_by_job_id(job_id).await? {
                Some(record) if record.status != ExecutionStatus::InProgress => return Ok(record),
                Some(_) => {}
                None => {
                    return Err(OrchestratorError::internal(format!(
                        "执行记录不存在: {job_id}"
                    )))
                }
            }
        }
    }

    /// 同类任务最近执行情况
    pub async fn recall(&self, kind: TaskKind) -> OrchestratorResult<ExecutionInsight> {
        let records = self
            .records
            .recent_by_kind(kind, self.config.recall_sample_size)
            .await?;
        Ok(ExecutionInsight::from_records(kind, &records))
    }

    async fn log_recall(&self, kind: TaskKind) {
        match self.recall(kind).await {
            Ok(insight) if insight.samples > 0 => debug!(
                samples = insight.samples,
                success_rate = insight.success_rate,
                expected_ms = insight.avg_duration_ms,
                "同类任务历史"
            ),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "读取同类任务历史失败"),
        }
    }
}

/// 重复请求沿用原始作业的终态
fn settle_duplicate(record: ExecutionRecord) -> OrchestratorResult<ExecutionOutcome> {
    match record.status {
        ExecutionStatus::Failed => Err(OrchestratorError::DuplicateFailed {
            job_id: record.job_id.to_string(),
            message: record.error.unwrap_or_else(|| "执行失败".to_string()),
        }),
        _ => Ok(ExecutionOutcome::from_record(&record, true)),
    }
}

#[async_trait]
impl TaskExecutor for ExecutionCore {
    fn precheck(&self, payload: &TaskPayload) -> OrchestratorResult<()> {
        payload.validate()?;
        self.rules.evaluate(payload).map(|_| ())
    }

    async fn execute(&self, task: &Task) -> OrchestratorResult<ExecutionOutcome> {
        ExecutionCore::execute(self, &task.payload, ExecuteOptions::default()).await
    }
}

impl std::fmt::Debug for ExecutionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCore")
            .field("config", &self.config)
            .field("rules", &self.rules.len())
            .finish()
    }
}
