use std::time::Duration;

use orchestrator_core::{OrchestratorError, SchedulerConfig};
use orchestrator_domain::Task;
use tracing::debug;

/// 调度器重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 基础重试间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            backoff_multiplier: config.retry_backoff_multiplier,
            jitter_factor: config.retry_jitter_factor,
        }
    }

    /// 任务失败后是否重新排队
    pub fn should_retry(&self, task: &Task, error: &OrchestratorError) -> bool {
        if !error.is_retryable() {
            debug!("任务 {} 的错误不可重试: {}", task.id, error);
            return false;
        }
        task.can_retry()
    }

    /// 第 `retry_count` 次重试前的等待时间：base × multiplier^retry_count，封顶后加抖动
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(self.base_delay_ms as f64).max(0.0);
        Duration::from_millis(final_ms as u64)
    }
}
