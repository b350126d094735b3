//! 可观测性：Prometheus 指标导出、指标采集与生命周期事件输出

pub mod event_sinks;
pub mod metrics_collector;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

pub use event_sinks::{ChannelEventSink, CompositeEventSink, TracingEventSink};
pub use metrics_collector::MetricsCollector;

/// 安装全局 Prometheus 记录器并在 `bind_address` 上暴露 `/metrics`
///
/// 必须在 tokio 运行时内调用。
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}
