use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    admission::AdmissionConfig,
    database::DatabaseConfig,
    execution::{ExecutionConfig, LedgerConfig},
    observability::ObservabilityConfig,
    registry::{RateLimitConfig, RegistryConfig},
    scheduler::SchedulerConfig,
};
use crate::circuit_breaker::CircuitBreakerConfig;

/// 启动时自动注册的一组Worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Worker类型/能力标签
    pub worker_type: String,
    /// 该类型注册的Worker数量
    pub count: u32,
    /// 每个Worker的并发容量
    pub capacity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_type.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker类型不能为空"));
        }
        if self.capacity == 0 {
            return Err(anyhow::anyhow!("Worker容量必须大于0: {}", self.worker_type));
        }
        if let Some(breaker) = &self.breaker {
            breaker.validate()?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub admission: AdmissionConfig,
    pub execution: ExecutionConfig,
    pub ledger: LedgerConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
    pub workers: Vec<WorkerPoolConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            registry: RegistryConfig::default(),
            admission: AdmissionConfig::default(),
            execution: ExecutionConfig::default(),
            ledger: LedgerConfig::default(),
            database: DatabaseConfig::default(),
            observability: ObservabilityConfig::default(),
            workers: vec![WorkerPoolConfig {
                worker_type: "ledger".to_string(),
                count: 2,
                capacity: 4,
                breaker: None,
                rate_limit: None,
            }],
        }
    }
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: ORCHESTRATOR_, nested keys separated by `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/orchestrator.toml", "orchestrator.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ORCHESTRATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.registry.validate().context("Worker注册表配置验证失败")?;
        self.admission.validate().context("准入控制配置验证失败")?;
        self.execution.validate().context("执行核心配置验证失败")?;
        self.ledger.validate().context("账本配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        for pool in &self.workers {
            pool.validate().context("Worker池配置验证失败")?;
        }
        Ok(())
    }
}
