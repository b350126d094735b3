use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;

/// Worker限流配置（固定窗口）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 窗口内允许的最大分配次数
    pub max_per_window: u32,
    /// 窗口长度（秒）
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 600,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_per_window == 0 {
            return Err(anyhow::anyhow!("限流窗口内最大次数必须大于0"));
        }
        if self.window_secs == 0 {
            return Err(anyhow::anyhow!("限流窗口长度必须大于0"));
        }
        Ok(())
    }
}

/// Worker注册表配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 心跳间隔（秒），超过两倍间隔未收到心跳视为失效
    pub heartbeat_interval_secs: u64,
    /// 健康度滚动窗口大小
    pub health_window: usize,
    /// 窗口内样本数达到该值后才进行健康分级
    pub health_min_samples: usize,
    /// 错误率超过该值判定为失效
    pub failed_error_rate: f64,
    /// 错误率超过该值判定为降级
    pub degraded_error_rate: f64,
    /// 自动重启最大尝试次数
    pub max_restart_attempts: u32,
    /// 自动重启基础延迟（毫秒）
    pub restart_base_delay_ms: u64,
    /// 自动重启最大延迟（毫秒）
    pub restart_max_delay_ms: u64,
    /// 延迟滑动平均系数
    pub latency_smoothing: f64,
    /// 注册时未指定的默认熔断配置
    pub default_breaker: CircuitBreakerConfig,
    /// 注册时未指定的默认限流配置
    pub default_rate_limit: RateLimitConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            health_window: 20,
            health_min_samples: 5,
            failed_error_rate: 0.5,
            degraded_error_rate: 0.2,
            max_restart_attempts: 3,
            restart_base_delay_ms: 1_000,
            restart_max_delay_ms: 60_000,
            latency_smoothing: 0.2,
            default_breaker: CircuitBreakerConfig::default(),
            default_rate_limit: RateLimitConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// 心跳超时时间 = 2 × 心跳间隔
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    /// 第 `attempt` 次重启前的退避延迟
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self.restart_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.restart_max_delay_ms))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.health_window == 0 || self.health_min_samples == 0 {
            return Err(anyhow::anyhow!("健康度窗口和最小样本数必须大于0"));
        }
        if self.health_min_samples > self.health_window {
            return Err(anyhow::anyhow!("最小样本数不能大于健康度窗口"));
        }
        if !(0.0..=1.0).contains(&self.failed_error_rate)
            || !(0.0..=1.0).contains(&self.degraded_error_rate)
        {
            return Err(anyhow::anyhow!("错误率阈值必须在0.0到1.0之间"));
        }
        if self.degraded_error_rate > self.failed_error_rate {
            return Err(anyhow::anyhow!("降级阈值不能大于失效阈值"));
        }
        if !(0.0..=1.0).contains(&self.latency_smoothing) {
            return Err(anyhow::anyhow!("延迟平滑系数必须在0.0到1.0之间"));
        }
        self.default_breaker.validate()?;
        self.default_rate_limit.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_delay_doubles_and_caps() {
        let config = RegistryConfig {
            restart_base_delay_ms: 100,
            restart_max_delay_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.restart_delay(0), Duration::from_millis(100));
        assert_eq!(config.restart_delay(1), Duration::from_millis(200));
        assert_eq!(config.restart_delay(2), Duration::from_millis(400));
        assert_eq!(config.restart_delay(3), Duration::from_millis(500));
        assert_eq!(config.restart_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_heartbeat_timeout_is_twice_interval() {
        let config = RegistryConfig::default();
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(60));
    }
}
