use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::{ResourceMetricsSource, ResourceSnapshot};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// 资源监控配置
#[derive(Debug, Clone)]
pub struct ResourceMonitorConfig {
    /// 内存使用警告阈值（百分比）
    pub memory_warning_percent: f64,
    /// CPU使用警告阈值（百分比）
    pub cpu_warning_percent: f64,
    /// 历史数据保留数量
    pub history_size: usize,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            memory_warning_percent: 80.0,
            cpu_warning_percent: 80.0,
            history_size: 60, // 保留60个数据点
        }
    }
}

/// 资源监控器
///
/// 在 Linux 上读取 `/proc` 估算进程内存占比与负载；其他平台返回零值。
/// 活跃连接数由调用方通过 [`ResourceMonitor::connection_opened`] 等维护。
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    active_connections: AtomicUsize,
    history: RwLock<VecDeque<ResourceSnapshot>>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(ResourceMonitorConfig::default())
    }
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig) -> Self {
        Self {
            config,
            active_connections: AtomicUsize::new(0),
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// 获取历史统计数据
    pub async fn history(&self) -> Vec<ResourceSnapshot> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn latest(&self) -> Option<ResourceSnapshot> {
        self.history.read().await.back().cloned()
    }

    async fn collect(&self) -> ResourceSnapshot {
        let snapshot = ResourceSnapshot::new(
            Self::cpu_percent().await,
            Self::memory_percent().await,
            self.active_connections.load(Ordering::SeqCst),
        );

        if snapshot.memory_percent >= self.config.memory_warning_percent {
            warn!(
                memory_percent = snapshot.memory_percent,
                threshold = self.config.memory_warning_percent,
                "内存占用过高"
            );
        }
        if snapshot.cpu_percent >= self.config.cpu_warning_percent {
            warn!(
                cpu_percent = snapshot.cpu_percent,
                threshold = self.config.cpu_warning_percent,
                "CPU负载过高"
            );
        }

        let mut history = self.history.write().await;
        history.push_back(snapshot.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }
        debug!(?snapshot, "资源统计已采集");
        snapshot
    }

    #[cfg(target_os = "linux")]
    async fn memory_percent() -> f64 {
        let rss_kb = tokio::fs::read_to_string("/proc/self/status")
            .await
            .ok()
            .and_then(|s| parse_kb_field(&s, "VmRSS:"));
        let total_kb = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|s| parse_kb_field(&s, "MemTotal:"));
        match (rss_kb, total_kb) {
            (Some(rss), Some(total)) if total > 0 => rss as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn memory_percent() -> f64 {
        0.0
    }

    /// 1分钟平均负载除以可用核数
    #[cfg(target_os = "linux")]
    async fn cpu_percent() -> f64 {
        let load = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()));
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        load.map(|l| (l / cores * 100.0).min(100.0)).unwrap_or(0.0)
    }

    #[cfg(not(target_os = "linux"))]
    async fn cpu_percent() -> f64 {
        0.0
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kb_field(content: &str, field: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

#[async_trait]
impl ResourceMetricsSource for ResourceMonitor {
    async fn snapshot(&self) -> OrchestratorResult<ResourceSnapshot> {
        Ok(self.collect().await)
    }
}
