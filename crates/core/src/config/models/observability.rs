use serde::{Deserialize, Serialize};

/// 可观测性配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// pretty | json | compact
    pub log_format: String,
    pub metrics_enabled: bool,
    /// Prometheus 导出监听地址
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("无效的日志格式: {}", self.log_format));
        }
        if self.metrics_enabled {
            self.metrics_bind_address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow::anyhow!("无效的指标监听地址: {e}"))?;
        }
        Ok(())
    }
}
