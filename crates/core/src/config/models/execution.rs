use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 业务规则配置，金额以十进制字符串表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// 单笔金额上限，超过为CRITICAL
    pub max_single_amount: String,
    /// 大额提醒阈值，超过为HIGH警告
    pub large_amount_warning: String,
    /// 允许的币种，为空表示不限制
    pub allowed_currencies: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_single_amount: "1000000".to_string(),
            large_amount_warning: "10000".to_string(),
            allowed_currencies: Vec::new(),
        }
    }
}

/// 执行核心配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// 去重窗口（秒）
    pub dedup_window_secs: u64,
    /// 执行层最大尝试次数（处理写冲突等瞬时错误）
    pub max_attempts: u32,
    /// 执行层重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 执行层重试最大延迟（毫秒）
    pub retry_max_delay_ms: u64,
    /// 统计相似任务时回溯的记录数
    pub recall_sample_size: usize,
    /// 重复请求等待进行中原始作业结束的上限（毫秒）
    pub inflight_wait_ms: u64,
    /// 等待期间查询原始作业记录的间隔（毫秒）
    pub inflight_poll_ms: u64,
    pub rules: RulesConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300, // 5分钟
            max_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            recall_sample_size: 100,
            inflight_wait_ms: 30_000,
            inflight_poll_ms: 20,
            rules: RulesConfig::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn inflight_wait(&self) -> Duration {
        Duration::from_millis(self.inflight_wait_ms)
    }

    pub fn inflight_poll_interval(&self) -> Duration {
        Duration::from_millis(self.inflight_poll_ms)
    }

    /// 第 `attempt` 次失败后的等待时间（attempt 从1开始）
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("执行层最大尝试次数必须大于0"));
        }
        if self.inflight_poll_ms == 0 {
            return Err(anyhow::anyhow!("进行中作业的查询间隔必须大于0"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(anyhow::anyhow!("执行层最大重试延迟不能小于基础延迟"));
        }
        if self.rules.max_single_amount.trim().is_empty()
            || self.rules.large_amount_warning.trim().is_empty()
        {
            return Err(anyhow::anyhow!("业务规则金额阈值不能为空"));
        }
        Ok(())
    }
}

/// 账本配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// 小数位数，四舍五入（half-up）
    pub decimal_places: u32,
    /// 扣款对方的清算账户前缀，后接币种
    pub clearing_account_prefix: String,
    /// 余额调整对方的调整账户前缀，后接币种
    pub adjustment_account_prefix: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            decimal_places: 8,
            clearing_account_prefix: "system:clearing".to_string(),
            adjustment_account_prefix: "system:adjustment".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.decimal_places > 18 {
            return Err(anyhow::anyhow!("小数位数不能超过18"));
        }
        if self.clearing_account_prefix.is_empty() || self.adjustment_account_prefix.is_empty() {
            return Err(anyhow::anyhow!("系统账户前缀不能为空"));
        }
        if self.clearing_account_prefix == self.adjustment_account_prefix {
            return Err(anyhow::anyhow!("清算账户与调整账户前缀不能相同"));
        }
        Ok(())
    }
}
