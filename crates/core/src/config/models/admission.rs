use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 降级策略配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub enabled: bool,
    /// 可被暂停派发的非关键Worker类型
    pub non_critical_categories: Vec<String>,
    /// 无论负载如何都不暂停的Worker类型
    pub exempt_categories: Vec<String>,
    /// 活跃调用方数量低于该值时暂停非关键类型
    pub active_caller_floor: usize,
}

/// 准入控制配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// 同时在途请求上限
    pub max_in_flight: usize,
    /// 等待队列上限，满时直接拒绝
    pub max_queue_size: usize,
    /// 排队等待超时（毫秒）
    pub queue_timeout_ms: u64,
    /// CPU压力阈值（百分比）
    pub cpu_threshold_percent: f64,
    /// 内存压力阈值（百分比）
    pub memory_threshold_percent: f64,
    /// 资源采样周期（毫秒）
    pub sample_interval_ms: u64,
    pub degradation: DegradationConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            max_queue_size: 256,
            queue_timeout_ms: 5_000,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            sample_interval_ms: 5_000,
            degradation: DegradationConfig::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_in_flight == 0 {
            return Err(anyhow::anyhow!("最大在途请求数必须大于0"));
        }
        if self.queue_timeout_ms == 0 {
            return Err(anyhow::anyhow!("排队超时时间必须大于0"));
        }
        if !(0.0..=100.0).contains(&self.cpu_threshold_percent)
            || !(0.0..=100.0).contains(&self.memory_threshold_percent)
        {
            return Err(anyhow::anyhow!("资源压力阈值必须在0到100之间"));
        }
        if self.sample_interval_ms == 0 {
            return Err(anyhow::anyhow!("资源采样周期必须大于0"));
        }
        Ok(())
    }
}
