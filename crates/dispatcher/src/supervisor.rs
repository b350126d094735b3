use std::time::Duration;

use orchestrator_core::{OrchestratorError, SchedulerConfig};
use orchestrator_domain::{TaskId, WorkerId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler::TaskOrchestrator;
use crate::worker_registry::WorkerRegistry;

/// 巡检配置
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// 巡检周期
    pub interval: Duration,
    /// 运行超过该时长的任务视为卡死
    pub stuck_task_threshold: Duration,
}

impl SupervisorConfig {
    pub fn from_config(scheduler: &SchedulerConfig) -> Self {
        Self {
            interval: scheduler.supervisor_interval(),
            stuck_task_threshold: scheduler.stuck_task_threshold(),
        }
    }
}

/// 一次巡检的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// 心跳超时、已安排重启的Worker
    pub expired_workers: Vec<WorkerId>,
    /// 被强制失败的任务
    pub stuck_tasks: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_workers.is_empty() && self.stuck_tasks.is_empty()
    }
}

/// 巡检器：心跳超时检测和卡死任务保护
#[derive(Clone)]
pub struct Supervisor {
    orchestrator: TaskOrchestrator,
    registry: WorkerRegistry,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(orchestrator: TaskOrchestrator, config: SupervisorConfig) -> Self {
        let registry = orchestrator.registry().clone();
        Self {
            orchestrator,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// 心跳超时阈值，来自注册表配置
    pub fn heartbeat_timeout(&self) -> Duration {
        self.registry.config().heartbeat_timeout()
    }

    pub async fn sweep(&self) -> SweepReport {
        let expired_workers = self.registry.check_heartbeats().await;
        if !expired_workers.is_empty() {
            warn!(
                "检测到 {} 个心跳超时的Worker (阈值 {}s)",
                expired_workers.len(),
                self.heartbeat_timeout().as_secs()
            );
        }

        let mut stuck_tasks = Vec::new();
        let threshold = self.config.stuck_task_threshold;
        for running in self.orchestrator.running_tasks_older_than(threshold).await {
            warn!(
                "任务 {} 在Worker {} 上已运行 {}ms，超过阈值 {}ms",
                running.task_id,
                running.worker_id,
                running.elapsed.as_millis(),
                threshold.as_millis()
            );
            let reason = OrchestratorError::StuckTask {
                id: running.task_id.to_string(),
            };
            if self
                .orchestrator
                .force_fail(running.task_id, running.token, reason)
                .await
            {
                stuck_tasks.push(running.task_id);
            }
        }

        let report = SweepReport {
            expired_workers,
            stuck_tasks,
        };
        if report.is_empty() {
            debug!("巡检完成，未发现异常");
        }
        report
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!("启动巡检循环 (周期 {}ms)", self.config.interval.as_millis());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出巡检循环");
                    break;
                }
            }
        }
    }

    pub fn spawn(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    }
}
