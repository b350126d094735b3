use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator_core::{AppConfig, DatabaseBackend, OrchestratorResult};
use orchestrator_dispatcher::{
    AdmissionController, Supervisor, SupervisorConfig, TaskOrchestrator, WorkerRegistry,
};
use orchestrator_domain::{
    EventSink, ExecutionRecordRepository, LedgerRepository, ResourceMetricsSource,
    SubmitTaskRequest, TaskId, TaskRepository, WorkerId, WorkerSpec,
};
use orchestrator_infrastructure::{
    CompositeEventSink, DatabaseManager, InMemoryExecutionRecordRepository,
    InMemoryLedgerRepository, InMemoryTaskRepository, ResourceMonitor,
    SqliteExecutionRecordRepository, SqliteLedgerRepository, SqliteTaskRepository,
    TracingEventSink,
};
use orchestrator_worker::{ExecutionCore, LedgerService};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct Repositories {
    tasks: Arc<dyn TaskRepository>,
    records: Arc<dyn ExecutionRecordRepository>,
    ledger: Arc<dyn LedgerRepository>,
}

/// 主应用程序：组装存储、执行核心、注册表、准入控制、编排器与巡检器
pub struct Application {
    config: AppConfig,
    orchestrator: TaskOrchestrator,
    supervisor: Supervisor,
    ledger: Arc<LedgerService>,
    monitor: Arc<ResourceMonitor>,
    database: Option<DatabaseManager>,
    local_workers: Vec<WorkerId>,
}

impl Application {
    /// 按配置创建应用实例，并注册配置中声明的本地Worker池
    pub async fn new(config: AppConfig) -> Result<Self> {
        Self::with_events(config, Vec::new()).await
    }

    /// 在默认的日志事件输出之外追加事件接收端
    pub async fn with_events(
        config: AppConfig,
        extra_sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        info!("初始化应用程序 (存储后端: {:?})", config.database.backend);

        let mut composite = CompositeEventSink::new().with(Arc::new(TracingEventSink));
        for sink in extra_sinks {
            composite = composite.with(sink);
        }
        let events: Arc<dyn EventSink> = Arc::new(composite);

        let (repositories, database) = create_repositories(&config).await?;

        let ledger = Arc::new(LedgerService::new(
            repositories.ledger,
            config.ledger.clone(),
            events.clone(),
        ));
        let executor = Arc::new(
            ExecutionCore::new(config.execution.clone(), repositories.records, ledger.clone())
                .context("创建执行核心失败")?,
        );

        let registry = WorkerRegistry::new(config.registry.clone(), events.clone());
        let admission = AdmissionController::new(config.admission.clone());
        let orchestrator = TaskOrchestrator::new(
            config.scheduler.clone(),
            registry,
            admission,
            executor,
            repositories.tasks,
            events,
        );
        let supervisor = Supervisor::new(
            orchestrator.clone(),
            SupervisorConfig::from_config(&config.scheduler),
        );

        let mut local_workers = Vec::new();
        for pool in &config.workers {
            for _ in 0..pool.count {
                let mut spec = WorkerSpec::new(pool.worker_type.clone(), pool.capacity);
                if let Some(breaker) = &pool.breaker {
                    spec = spec.with_breaker(breaker.clone());
                }
                if let Some(rate_limit) = &pool.rate_limit {
                    spec = spec.with_rate_limit(rate_limit.clone());
                }
                let id = orchestrator
                    .register_worker(spec)
                    .await
                    .with_context(|| format!("注册Worker池 {} 失败", pool.worker_type))?;
                local_workers.push(id);
            }
            info!(
                "Worker池 {} 已注册 {} 个Worker (容量 {})",
                pool.worker_type, pool.count, pool.capacity
            );
        }

        Ok(Self {
            config,
            orchestrator,
            supervisor,
            ledger,
            monitor: Arc::new(ResourceMonitor::default()),
            database,
            local_workers,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn local_workers(&self) -> &[WorkerId] {
        &self.local_workers
    }

    /// 外部调用方提交任务，调用期间计为一个活跃调用方
    pub async fn submit_task(&self, request: SubmitTaskRequest) -> OrchestratorResult<TaskId> {
        self.monitor.connection_opened();
        let result = self.orchestrator.submit_task(request).await;
        self.monitor.connection_closed();
        result
    }

    /// 启动后台循环并阻塞到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用后台组件");
        let metrics_source: Arc<dyn ResourceMetricsSource> = self.monitor.clone();

        let mut handles: Vec<(&'static str, JoinHandle<()>)> = vec![
            ("分配循环", self.orchestrator.spawn(shutdown_rx.resubscribe())),
            ("巡检循环", self.supervisor.spawn(shutdown_rx.resubscribe())),
        ];

        let admission = self.orchestrator.admission().clone();
        let sampler_rx = shutdown_rx.resubscribe();
        let sampler = tokio::spawn(async move {
            admission.run_sampler(metrics_source, sampler_rx).await;
        });
        handles.push(("资源采样", sampler));
        handles.push((
            "本地心跳",
            self.spawn_local_heartbeats(shutdown_rx.resubscribe()),
        ));

        let mut shutdown_rx = shutdown_rx;
        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号，等待后台组件退出");

        for (name, handle) in handles {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(())) => info!("{} 已停止", name),
                Ok(Err(e)) => error!("{} 异常退出: {}", name, e),
                Err(_) => warn!("{} 停止超时", name),
            }
        }

        if let Some(database) = &self.database {
            database.close().await;
        }
        info!("应用已停止");
        Ok(())
    }

    /// 进程内Worker池按心跳间隔上报心跳
    fn spawn_local_heartbeats(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let workers = self.local_workers.clone();
        let interval = self.config.registry.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for id in &workers {
                            if let Err(e) = orchestrator.heartbeat(*id).await {
                                warn!("Worker {} 心跳上报失败: {}", id, e);
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

async fn create_repositories(
    config: &AppConfig,
) -> Result<(Repositories, Option<DatabaseManager>)> {
    match config.database.backend {
        DatabaseBackend::Memory => {
            info!("使用内存存储");
            let repositories = Repositories {
                tasks: Arc::new(InMemoryTaskRepository::new()),
                records: Arc::new(InMemoryExecutionRecordRepository::new()),
                ledger: Arc::new(InMemoryLedgerRepository::new()),
            };
            Ok((repositories, None))
        }
        DatabaseBackend::Sqlite => {
            let database = DatabaseManager::new(&config.database)
                .await
                .context("连接数据库失败")?;
            database.migrate().await.context("数据库迁移失败")?;
            let pool = database.pool().clone();
            let repositories = Repositories {
                tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
                records: Arc::new(SqliteExecutionRecordRepository::new(pool.clone())),
                ledger: Arc::new(SqliteLedgerRepository::new(pool)),
            };
            Ok((repositories, Some(database)))
        }
    }
}
