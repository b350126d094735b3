use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use job_orchestrator::{wait_for_signal, Application, ShutdownManager};
use orchestrator_core::{init_logging, AppConfig, LogFormat};
use orchestrator_infrastructure::init_metrics;
use tracing::{error, info, warn};

/// 任务编排与执行核心
#[derive(Debug, Parser)]
#[command(name = "orchestrator", version, about = "任务编排与执行核心")]
struct Cli {
    /// 配置文件路径，未指定时依次查找 config/orchestrator.toml 与 orchestrator.toml
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, value_name = "FORMAT", value_parser = ["pretty", "json", "compact"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level)
        .to_string();
    let log_format: LogFormat = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.observability.log_format)
        .parse()?;
    init_logging(&log_level, log_format)?;

    info!("启动任务编排与执行核心");
    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address)?;
    }

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("任务编排与执行核心已退出");
    Ok(())
}
