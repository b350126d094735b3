//! 任务编排器
//!
//! 提交的任务先经过准入控制，持有名额直到进入终态。分配循环按优先级取队首，
//! 交给负载最低的可用Worker；队首没有可用Worker时本轮停止，等待可用信号或下一个周期。
//! 每次执行携带一个尝试令牌，令牌不匹配的结果一律丢弃。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use orchestrator_core::{OrchestratorError, OrchestratorResult, SchedulerConfig};
use orchestrator_domain::{
    EventSink, ExecutionOutcome, LifecycleEvent, SchedulerStats, SubmitTaskRequest, Task,
    TaskExecutor, TaskId, TaskRepository, TaskStatus, WorkerHealthSummary, WorkerId,
    WorkerSnapshot, WorkerSpec,
};
use orchestrator_infrastructure::MetricsCollector;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::queue::{QueueEntry, TaskQueue};
use crate::retry_service::RetryPolicy;
use crate::worker_registry::WorkerRegistry;

#[derive(Debug, Clone, Copy)]
struct Attempt {
    token: u64,
    worker_id: WorkerId,
    started_at: Instant,
}

struct TaskEntry {
    task: Task,
    attempt: Option<Attempt>,
    /// 随条目一起释放
    _permit: AdmissionPermit,
    status: watch::Sender<TaskStatus>,
}

#[derive(Debug)]
struct DailyCounters {
    day: NaiveDate,
    completed: u64,
    failed: u64,
}

impl Default for DailyCounters {
    fn default() -> Self {
        Self {
            day: Utc::now().date_naive(),
            completed: 0,
            failed: 0,
        }
    }
}

impl DailyCounters {
    fn roll(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            *self = Self {
                day: today,
                completed: 0,
                failed: 0,
            };
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: TaskQueue,
    tasks: HashMap<TaskId, TaskEntry>,
    running: usize,
    counters: DailyCounters,
}

/// 正在执行的任务，供巡检使用
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub token: u64,
    pub elapsed: Duration,
}

struct OrchestratorShared {
    config: SchedulerConfig,
    registry: WorkerRegistry,
    admission: AdmissionController,
    executor: Arc<dyn TaskExecutor>,
    tasks: Arc<dyn TaskRepository>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    metrics: MetricsCollector,
    state: Mutex<SchedulerState>,
    sequence: AtomicU64,
    next_token: AtomicU64,
    wake: Arc<Notify>,
}

/// 任务编排器
#[derive(Clone)]
pub struct TaskOrchestrator {
    shared: Arc<OrchestratorShared>,
}

impl TaskOrchestrator {
    pub fn new(
        config: SchedulerConfig,
        registry: WorkerRegistry,
        admission: AdmissionController,
        executor: Arc<dyn TaskExecutor>,
        tasks: Arc<dyn TaskRepository>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        let wake = registry.availability_signal();
        Self {
            shared: Arc::new(OrchestratorShared {
                config,
                registry,
                admission,
                executor,
                tasks,
                events,
                retry,
                metrics: MetricsCollector::new(),
                state: Mutex::new(SchedulerState::default()),
                sequence: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
                wake,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.shared.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.shared.admission
    }

    /// 提交任务
    ///
    /// 预检失败、准入被拒绝或排队超时时立即返回错误，任务不会入队。
    pub async fn submit_task(&self, request: SubmitTaskRequest) -> OrchestratorResult<TaskId> {
        let shared = &self.shared;
        shared.executor.precheck(&request.payload)?;

        let permit = shared
            .admission
            .admit(request.priority)
            .into_permit()
            .await?;

        let sequence = shared.sequence.fetch_add(1, Ordering::SeqCst);
        let max_retries = request
            .max_retries
            .unwrap_or(shared.config.default_max_retries);
        let task = Task::new(
            request.payload,
            request.priority,
            sequence,
            request.required_worker_type,
            max_retries,
        );
        let task_id = task.id;
        shared.tasks.create(&task).await?;

        {
            let mut state = shared.state.lock().await;
            state.queue.push(task.id, task.priority, task.sequence);
            shared
                .metrics
                .record_task_submitted(task.kind.as_str(), task.priority.as_str());
            shared.events.publish(LifecycleEvent::TaskSubmitted {
                task_id,
                kind: task.kind,
                priority: task.priority,
            });
            info!(
                "提交任务 {} (类型: {}, 优先级: {})",
                task_id,
                task.kind.as_str(),
                task.priority.as_str()
            );
            let (status, _) = watch::channel(task.status);
            state.tasks.insert(
                task_id,
                TaskEntry {
                    task,
                    attempt: None,
                    _permit: permit,
                    status,
                },
            );
            shared.metrics.set_queue_depth(state.queue.len());
        }

        shared.dispatch_pending().await;
        Ok(task_id)
    }

    /// 执行一轮分配，返回本轮启动的任务数
    pub async fn dispatch_pending(&self) -> usize {
        self.shared.dispatch_pending().await
    }

    /// 等待任务进入终态
    pub async fn wait_for_task(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        let receiver = {
            let state = self.shared.state.lock().await;
            state.tasks.get(&task_id).map(|e| e.status.subscribe())
        };
        if let Some(mut receiver) = receiver {
            // 条目在终态时移除，发送端关闭同样意味着已结束
            let _ = receiver.wait_for(|s| s.is_terminal()).await;
        }
        self.shared
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))
    }

    pub async fn task(&self, task_id: TaskId) -> OrchestratorResult<Task> {
        if let Some(entry) = self.shared.state.lock().await.tasks.get(&task_id) {
            return Ok(entry.task.clone());
        }
        self.shared
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))
    }

    pub async fn register_worker(&self, spec: WorkerSpec) -> OrchestratorResult<WorkerId> {
        self.shared.registry.register(spec).await
    }

    pub async fn heartbeat(&self, worker_id: WorkerId) -> OrchestratorResult<()> {
        self.shared.registry.heartbeat(worker_id).await
    }

    pub async fn stats(&self) -> SchedulerStats {
        let (pending, running, completed_today, failed_today) = {
            let mut state = self.shared.state.lock().await;
            state.counters.roll();
            let pending = state
                .tasks
                .values()
                .filter(|e| matches!(e.task.status, TaskStatus::Pending | TaskStatus::Retrying))
                .count();
            (
                pending,
                state.running,
                state.counters.completed,
                state.counters.failed,
            )
        };
        SchedulerStats {
            total_workers: self.shared.registry.total_count().await,
            available_workers: self.shared.registry.available_count().await,
            pending,
            running,
            completed_today,
            failed_today,
        }
    }

    pub async fn worker_health(&self) -> WorkerHealthSummary {
        self.shared.registry.health_summary().await
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.shared.registry.snapshots().await
    }

    /// 运行时间超过 `threshold` 的任务
    pub async fn running_tasks_older_than(&self, threshold: Duration) -> Vec<RunningTask> {
        let now = Instant::now();
        let state = self.shared.state.lock().await;
        state
            .tasks
            .iter()
            .filter_map(|(id, entry)| {
                let attempt = entry.attempt?;
                let elapsed = now.duration_since(attempt.started_at);
                (elapsed > threshold).then_some(RunningTask {
                    task_id: *id,
                    worker_id: attempt.worker_id,
                    token: attempt.token,
                    elapsed,
                })
            })
            .collect()
    }

    /// 强制失败一次执行，之后到达的结果会被丢弃。令牌已过期时返回 `false`
    pub async fn force_fail(&self, task_id: TaskId, token: u64, reason: OrchestratorError) -> bool {
        self.shared.force_fail(task_id, token, reason).await
    }

    /// 分配循环：被可用信号唤醒或按周期兜底
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.shared.config.dispatch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("启动任务分配循环");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出任务分配循环");
                    break;
                }
                _ = self.shared.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            self.shared.dispatch_pending().await;
        }
    }

    pub fn spawn(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    }
}

impl OrchestratorShared {
    async fn dispatch_pending(self: &Arc<Self>) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let paused = self.admission.paused_categories();
        let mut deferred: Vec<QueueEntry> = Vec::new();
        let mut launched = 0;

        while state.running < self.config.max_concurrent_tasks && !self.admission.is_throttled() {
            let Some(head) = state.queue.peek().copied() else {
                break;
            };
            let required = match state.tasks.get(&head.task_id) {
                Some(entry)
                    if matches!(entry.task.status, TaskStatus::Pending | TaskStatus::Retrying) =>
                {
                    entry.task.required_worker_type.clone()
                }
                _ => {
                    state.queue.pop();
                    continue;
                }
            };
            if let Some(category) = required.as_deref() {
                if paused.contains(category) {
                    debug!("任务 {} 所需类别 {} 已降级暂停", head.task_id, category);
                    state.queue.pop();
                    deferred.push(head);
                    continue;
                }
            }

            let Some(worker_id) = self
                .registry
                .pick_least_loaded(required.as_deref(), &paused)
                .await
            else {
                debug!("没有可用Worker，任务 {} 继续等待", head.task_id);
                break;
            };
            state.queue.pop();

            let Some(entry) = state.tasks.get_mut(&head.task_id) else {
                self.registry.release(worker_id).await;
                continue;
            };
            if let Err(e) = entry.task.transition_to(TaskStatus::Assigned) {
                error!("任务 {} 无法分配: {}", head.task_id, e);
                self.registry.release(worker_id).await;
                continue;
            }
            let token = self.next_token.fetch_add(1, Ordering::SeqCst);
            entry.task.assigned_worker = Some(worker_id);
            entry.attempt = Some(Attempt {
                token,
                worker_id,
                started_at: Instant::now(),
            });
            entry.status.send_replace(TaskStatus::Assigned);
            let snapshot = entry.task.clone();
            state.running += 1;

            self.persist(&snapshot).await;
            self.events.publish(LifecycleEvent::TaskAssigned {
                task_id: snapshot.id,
                worker_id,
            });
            info!(
                "任务 {} 分配给Worker {} (优先级: {}, 第 {} 次重试)",
                snapshot.id,
                worker_id,
                snapshot.priority.as_str(),
                snapshot.retry_count
            );

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared.run_attempt(snapshot, token, worker_id).await;
            });
            launched += 1;
        }

        for entry in deferred {
            state.queue.push_entry(entry);
        }
        self.metrics.set_queue_depth(state.queue.len());
        self.metrics.set_running_tasks(state.running);
        launched
    }

    async fn run_attempt(self: Arc<Self>, task: Task, token: u64, worker_id: WorkerId) {
        let task_id = task.id;
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if entry.attempt.map(|a| a.token) != Some(token) {
                return;
            }
            if entry.task.transition_to(TaskStatus::Running).is_ok() {
                entry.status.send_replace(TaskStatus::Running);
                let snapshot = entry.task.clone();
                self.persist(&snapshot).await;
            }
        }

        let started = Instant::now();
        let timeout = self.config.task_timeout();
        let executor = Arc::clone(&self.executor);
        // 超时只结束等待，执行本身继续运行并写回自己的执行记录
        let mut handle = tokio::spawn(async move { executor.execute(&task).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                self.finish_attempt(task_id, token, worker_id, flatten(joined), started.elapsed())
                    .await;
            }
            Err(_) => {
                warn!("任务 {} 执行超时 ({}ms)", task_id, timeout.as_millis());
                self.finish_attempt(
                    task_id,
                    token,
                    worker_id,
                    Err(OrchestratorError::ExecutionTimeout(timeout)),
                    started.elapsed(),
                )
                .await;
                let late = flatten(handle.await);
                self.finish_attempt(task_id, token, worker_id, late, started.elapsed())
                    .await;
            }
        }
    }

    async fn finish_attempt(
        self: &Arc<Self>,
        task_id: TaskId,
        token: u64,
        worker_id: WorkerId,
        result: OrchestratorResult<ExecutionOutcome>,
        elapsed: Duration,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let current = state
            .tasks
            .get(&task_id)
            .and_then(|e| e.attempt)
            .map(|a| a.token);
        if current != Some(token) {
            debug!("丢弃任务 {} 来自Worker {} 的过期结果", task_id, worker_id);
            self.metrics.record_late_result();
            self.events
                .publish(LifecycleEvent::LateResultDiscarded { task_id, worker_id });
            return;
        }
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        entry.attempt = None;
        state.running = state.running.saturating_sub(1);
        self.registry.release(worker_id).await;

        let result = result.and_then(|outcome| {
            if outcome.is_success() {
                Ok(outcome)
            } else {
                Err(OrchestratorError::WorkerFailure(
                    outcome.error.unwrap_or_else(|| "执行失败".to_string()),
                ))
            }
        });

        match result {
            Ok(outcome) => {
                self.registry.record_success(worker_id, elapsed).await;
                entry.task.job_id = Some(outcome.job_id);
                entry.task.last_error = None;
                if let Err(e) = entry.task.transition_to(TaskStatus::Completed) {
                    error!("任务 {} 无法标记完成: {}", task_id, e);
                }
                let snapshot = entry.task.clone();
                state.counters.roll();
                state.counters.completed += 1;
                self.persist(&snapshot).await;
                self.metrics
                    .record_task_completed(snapshot.kind.as_str(), elapsed.as_secs_f64());
                self.events.publish(LifecycleEvent::TaskCompleted {
                    task_id,
                    worker_id,
                    job_id: outcome.job_id,
                    duplicate: outcome.duplicate,
                });
                info!(
                    "任务 {} 完成 (Worker {}, 耗时 {}ms, 重复请求: {})",
                    task_id,
                    worker_id,
                    elapsed.as_millis(),
                    outcome.duplicate
                );
                finalize(state, task_id);
            }
            Err(error) => {
                // 业务拒绝或沿用原始作业的失败说明Worker工作正常
                if error.counts_against_worker() {
                    self.registry.record_failure(worker_id, &error).await;
                } else {
                    self.registry.record_success(worker_id, elapsed).await;
                }
                self.handle_failure(state, task_id, error).await;
            }
        }

        self.metrics.set_queue_depth(state.queue.len());
        self.metrics.set_running_tasks(state.running);
        drop(guard);
        self.wake.notify_one();
    }

    async fn handle_failure(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        task_id: TaskId,
        error: OrchestratorError,
    ) {
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return;
        };
        entry.task.retry_count += 1;
        entry.task.last_error = Some(error.to_string());

        if self.retry.should_retry(&entry.task, &error) {
            let delay = self
                .retry
                .delay_for(entry.task.retry_count.saturating_sub(1));
            if let Err(e) = entry.task.transition_to(TaskStatus::Retrying) {
                error!("任务 {} 无法进入重试: {}", task_id, e);
                return;
            }
            entry.status.send_replace(TaskStatus::Retrying);
            let snapshot = entry.task.clone();
            self.persist(&snapshot).await;
            self.metrics.record_task_retry(snapshot.kind.as_str());
            self.events.publish(LifecycleEvent::TaskRetrying {
                task_id,
                retry_count: snapshot.retry_count,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });
            warn!(
                "任务 {} 第 {}/{} 次失败，{}ms 后重试: {}",
                task_id,
                snapshot.retry_count,
                snapshot.max_retries,
                delay.as_millis(),
                error
            );

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.requeue(task_id).await;
            });
            return;
        }

        if let Err(e) = entry.task.transition_to(TaskStatus::Failed) {
            error!("任务 {} 无法标记失败: {}", task_id, e);
        }
        let snapshot = entry.task.clone();
        state.counters.roll();
        state.counters.failed += 1;
        self.persist(&snapshot).await;
        self.metrics
            .record_task_failed(snapshot.kind.as_str(), error.error_code());
        self.events.publish(LifecycleEvent::TaskFailed {
            task_id,
            retry_count: snapshot.retry_count,
            error: error.to_string(),
        });
        error!(
            "任务 {} 最终失败 (已重试 {} 次): {}",
            task_id, snapshot.retry_count, error
        );
        finalize(state, task_id);
    }

    /// 退避结束后以原有序号重新入队
    async fn requeue(&self, task_id: TaskId) {
        {
            let mut state = self.state.lock().await;
            let Some(entry) = state.tasks.get(&task_id) else {
                return;
            };
            if entry.task.status != TaskStatus::Retrying {
                return;
            }
            let (priority, sequence) = (entry.task.priority, entry.task.sequence);
            state.queue.push(task_id, priority, sequence);
            self.metrics.set_queue_depth(state.queue.len());
            debug!("任务 {} 重新入队", task_id);
        }
        self.wake.notify_one();
    }

    async fn force_fail(
        self: &Arc<Self>,
        task_id: TaskId,
        token: u64,
        reason: OrchestratorError,
    ) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return false;
        };
        let worker_id = match entry.attempt {
            Some(attempt) if attempt.token == token => attempt.worker_id,
            _ => return false,
        };
        entry.attempt = None;
        state.running = state.running.saturating_sub(1);
        self.registry.release(worker_id).await;
        self.registry.record_failure(worker_id, &reason).await;

        entry.task.last_error = Some(reason.to_string());
        if let Err(e) = entry.task.transition_to(TaskStatus::Failed) {
            error!("任务 {} 无法强制失败: {}", task_id, e);
        }
        let snapshot = entry.task.clone();
        state.counters.roll();
        state.counters.failed += 1;
        self.persist(&snapshot).await;
        self.metrics
            .record_task_failed(snapshot.kind.as_str(), reason.error_code());
        self.events.publish(LifecycleEvent::TaskFailed {
            task_id,
            retry_count: snapshot.retry_count,
            error: reason.to_string(),
        });
        error!("任务 {} 被强制失败 (Worker {}): {}", task_id, worker_id, reason);
        finalize(state, task_id);

        self.metrics.set_running_tasks(state.running);
        drop(guard);
        self.wake.notify_one();
        true
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.tasks.update(task).await {
            error!("持久化任务 {} 失败: {}", task.id, e);
        }
    }
}

/// 移除终态任务，同时释放其准入名额
fn finalize(state: &mut SchedulerState, task_id: TaskId) {
    if let Some(entry) = state.tasks.remove(&task_id) {
        entry.status.send_replace(entry.task.status);
    }
}

fn flatten(
    joined: Result<OrchestratorResult<ExecutionOutcome>, JoinError>,
) -> OrchestratorResult<ExecutionOutcome> {
    joined.unwrap_or_else(|e| {
        Err(OrchestratorError::WorkerFailure(format!(
            "执行任务异常退出: {e}"
        )))
    })
}
