use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 同时运行的任务上限
    pub max_concurrent_tasks: usize,
    /// 单个任务执行超时时间（毫秒）
    pub task_timeout_ms: u64,
    /// 未指定时的最大重试次数
    pub default_max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 重试最大延迟（毫秒）
    pub retry_max_delay_ms: u64,
    /// 重试退避倍数
    pub retry_backoff_multiplier: f64,
    /// 重试抖动因子 (0.0 - 1.0)
    pub retry_jitter_factor: f64,
    /// 兜底调度周期（毫秒），正常情况下由Worker释放事件驱动
    pub dispatch_interval_ms: u64,
    /// 巡检周期（毫秒）
    pub supervisor_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            task_timeout_ms: 30_000,
            default_max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000, // 1分钟
            retry_backoff_multiplier: 2.0,
            retry_jitter_factor: 0.1,
            dispatch_interval_ms: 1_000,
            supervisor_interval_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// 超过该运行时长的任务视为卡死
    pub fn stuck_task_threshold(&self) -> Duration {
        self.task_timeout() * 2
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }
        if self.task_timeout_ms == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }
        if self.default_max_retries == 0 {
            return Err(anyhow::anyhow!("默认最大重试次数必须大于0"));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("重试退避倍数不能小于1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(anyhow::anyhow!("重试抖动因子必须在0.0到1.0之间"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(anyhow::anyhow!("最大重试延迟不能小于基础延迟"));
        }
        if self.dispatch_interval_ms == 0 || self.supervisor_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度周期和巡检周期必须大于0"));
        }
        Ok(())
    }
}
