//! Worker注册表
//!
//! 每个Worker各自持有熔断器、固定窗口限流、健康度滑动窗口和重启计数。
//! 选择与占用在同一把写锁内完成，保证 `current_load` 不超过 `capacity`，
//! 半开状态下也只会放出一个试探请求。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_core::{
    CircuitBreaker, CircuitState, CircuitTransition, OrchestratorError, OrchestratorResult,
    RateLimitConfig, RegistryConfig,
};
use orchestrator_domain::{
    EventSink, LifecycleEvent, WorkerHealth, WorkerHealthSummary, WorkerId, WorkerSnapshot,
    WorkerSpec,
};
use orchestrator_infrastructure::MetricsCollector;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::strategies::{LeastLoadedStrategy, WorkerCandidate, WorkerSelectionStrategy};

/// 固定窗口限流
#[derive(Debug)]
struct RateWindow {
    config: RateLimitConfig,
    started_at: Instant,
    used: u32,
}

impl RateWindow {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            used: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started_at) >= self.config.window() {
            self.started_at = now;
            self.used = 0;
        }
    }

    fn has_capacity(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) >= self.config.window()
            || self.used < self.config.max_per_window
    }

    fn consume(&mut self, now: Instant) {
        self.roll(now);
        self.used += 1;
    }
}

#[derive(Debug)]
struct WorkerEntry {
    id: WorkerId,
    worker_type: String,
    capacity: u32,
    current_load: u32,
    health: WorkerHealth,
    breaker: CircuitBreaker,
    rate: RateWindow,
    /// 最近的执行结果，`true` 表示成功
    outcomes: VecDeque<bool>,
    avg_latency_ms: Option<f64>,
    restart_attempts: u32,
    last_heartbeat: Instant,
    registered_at: DateTime<Utc>,
}

impl WorkerEntry {
    fn is_available(&self, now: Instant) -> bool {
        self.health.accepts_work()
            && self.current_load < self.capacity
            && self.breaker.allows_assignment()
            && self.rate.has_capacity(now)
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn push_outcome(&mut self, success: bool, window: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > window {
            self.outcomes.pop_front();
        }
    }

    fn snapshot(&self, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            worker_type: self.worker_type.clone(),
            capacity: self.capacity,
            current_load: self.current_load,
            health: self.health,
            circuit_state: self.breaker.state(),
            available: self.is_available(now),
            error_rate: self.error_rate(),
            avg_latency_ms: self.avg_latency_ms.unwrap_or(0.0),
            restart_attempts: self.restart_attempts,
            millis_since_heartbeat: now.duration_since(self.last_heartbeat).as_millis() as u64,
            registered_at: self.registered_at,
        }
    }
}

struct RegistryShared {
    config: RegistryConfig,
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
    events: Arc<dyn EventSink>,
    metrics: MetricsCollector,
    available: Arc<Notify>,
}

/// Worker注册表
#[derive(Clone)]
pub struct WorkerRegistry {
    shared: Arc<RegistryShared>,
    strategy: Arc<dyn WorkerSelectionStrategy>,
    next_id: Arc<AtomicU64>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig, events: Arc<dyn EventSink>) -> Self {
        Self::with_strategy(config, events, Arc::new(LeastLoadedStrategy::new()))
    }

    pub fn with_strategy(
        config: RegistryConfig,
        events: Arc<dyn EventSink>,
        strategy: Arc<dyn WorkerSelectionStrategy>,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                config,
                workers: RwLock::new(HashMap::new()),
                events,
                metrics: MetricsCollector::new(),
                available: Arc::new(Notify::new()),
            }),
            strategy,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Worker可能变为可用时触发
    pub fn availability_signal(&self) -> Arc<Notify> {
        self.shared.available.clone()
    }

    pub async fn register(&self, spec: WorkerSpec) -> OrchestratorResult<WorkerId> {
        if spec.worker_type.trim().is_empty() {
            return Err(OrchestratorError::config_error("Worker类型不能为空"));
        }
        if spec.capacity == 0 {
            return Err(OrchestratorError::config_error("Worker容量必须大于0"));
        }
        let breaker_config = spec
            .breaker
            .unwrap_or_else(|| self.shared.config.default_breaker.clone());
        breaker_config
            .validate()
            .map_err(|e| OrchestratorError::config_error(e.to_string()))?;
        let rate_limit = spec
            .rate_limit
            .unwrap_or_else(|| self.shared.config.default_rate_limit.clone());
        rate_limit
            .validate()
            .map_err(|e| OrchestratorError::config_error(e.to_string()))?;

        let id = WorkerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = WorkerEntry {
            id,
            worker_type: spec.worker_type.clone(),
            capacity: spec.capacity,
            current_load: 0,
            health: WorkerHealth::Operational,
            breaker: CircuitBreaker::new(breaker_config),
            rate: RateWindow::new(rate_limit),
            outcomes: VecDeque::with_capacity(self.shared.config.health_window),
            avg_latency_ms: None,
            restart_attempts: 0,
            last_heartbeat: Instant::now(),
            registered_at: Utc::now(),
        };

        {
            let mut workers = self.shared.workers.write().await;
            workers.insert(id, entry);
            self.shared.events.publish(LifecycleEvent::WorkerRegistered {
                worker_id: id,
                worker_type: spec.worker_type.clone(),
                capacity: spec.capacity,
            });
        }
        info!(
            "注册Worker {} (类型: {}, 容量: {})",
            id, spec.worker_type, spec.capacity
        );
        self.shared.available.notify_one();
        Ok(id)
    }

    pub async fn heartbeat(&self, id: WorkerId) -> OrchestratorResult<()> {
        let mut workers = self.shared.workers.write().await;
        let entry = workers
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::worker_not_found(id.value()))?;
        entry.last_heartbeat = Instant::now();
        debug!("Worker {} 心跳", id);
        Ok(())
    }

    pub async fn is_available(&self, id: WorkerId) -> bool {
        let now = Instant::now();
        self.shared
            .workers
            .read()
            .await
            .get(&id)
            .is_some_and(|w| w.is_available(now))
    }

    /// 选出负载最低的可用Worker并占用一个容量
    ///
    /// 占用包括：负载加一、消耗限流额度、半开状态下占用试探名额。
    pub async fn pick_least_loaded(
        &self,
        required_type: Option<&str>,
        paused_categories: &HashSet<String>,
    ) -> Option<WorkerId> {
        let now = Instant::now();
        let mut workers = self.shared.workers.write().await;

        let candidates: Vec<WorkerCandidate> = workers
            .values()
            .filter(|w| required_type.map_or(true, |t| w.worker_type == t))
            .filter(|w| !paused_categories.contains(&w.worker_type))
            .filter(|w| w.is_available(now))
            .map(|w| WorkerCandidate {
                id: w.id,
                current_load: w.current_load,
                capacity: w.capacity,
            })
            .collect();

        let selected = self.strategy.select(&candidates)?;
        let entry = workers.get_mut(&selected)?;
        entry.current_load += 1;
        entry.rate.consume(now);
        entry.breaker.begin_trial();
        debug!(
            "选中Worker {} (策略: {}, 负载: {}/{})",
            selected,
            self.strategy.name(),
            entry.current_load,
            entry.capacity
        );
        Some(selected)
    }

    /// 归还一个容量
    pub async fn release(&self, id: WorkerId) {
        {
            let mut workers = self.shared.workers.write().await;
            if let Some(entry) = workers.get_mut(&id) {
                entry.current_load = entry.current_load.saturating_sub(1);
            }
        }
        self.shared.available.notify_one();
    }

    pub async fn record_success(&self, id: WorkerId, latency: Duration) {
        let mut workers = self.shared.workers.write().await;
        let Some(entry) = workers.get_mut(&id) else {
            return;
        };

        let sample = latency.as_secs_f64() * 1000.0;
        let alpha = self.shared.config.latency_smoothing;
        entry.avg_latency_ms = Some(match entry.avg_latency_ms {
            Some(avg) => avg * (1.0 - alpha) + sample * alpha,
            None => sample,
        });
        entry.push_outcome(true, self.shared.config.health_window);

        if let Some(transition) = entry.breaker.record_success() {
            self.shared.on_transition(entry, transition);
        }
        self.shared.evaluate_health(entry);
        drop(workers);
        self.shared.available.notify_one();
    }

    pub async fn record_failure(&self, id: WorkerId, reason: &OrchestratorError) {
        let mut workers = self.shared.workers.write().await;
        let Some(entry) = workers.get_mut(&id) else {
            return;
        };
        warn!("Worker {} 执行失败: {}", id, reason);

        entry.push_outcome(false, self.shared.config.health_window);
        if let Some(transition) = entry.breaker.record_failure() {
            self.shared.on_transition(entry, transition);
        }
        self.shared.evaluate_health(entry);
    }

    /// 标记心跳超时的Worker为失效并安排重启，返回本次新发现的Worker
    pub async fn check_heartbeats(&self) -> Vec<WorkerId> {
        let now = Instant::now();
        let timeout = self.shared.config.heartbeat_timeout();
        let mut workers = self.shared.workers.write().await;
        let mut expired = Vec::new();

        for entry in workers.values_mut() {
            if !entry.health.accepts_work() {
                continue;
            }
            let silent = now.duration_since(entry.last_heartbeat);
            if silent > timeout {
                warn!(
                    "Worker {} 心跳超时 ({}ms 未收到心跳)",
                    entry.id,
                    silent.as_millis()
                );
                self.shared
                    .mark_failed(entry, format!("心跳超时 {}ms", silent.as_millis()));
                expired.push(entry.id);
            }
        }
        expired
    }

    pub async fn snapshot(&self, id: WorkerId) -> OrchestratorResult<WorkerSnapshot> {
        let now = Instant::now();
        self.shared
            .workers
            .read()
            .await
            .get(&id)
            .map(|w| w.snapshot(now))
            .ok_or_else(|| OrchestratorError::worker_not_found(id.value()))
    }

    /// 所有Worker快照，按编号排序
    pub async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<WorkerSnapshot> = self
            .shared
            .workers
            .read()
            .await
            .values()
            .map(|w| w.snapshot(now))
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub async fn health_summary(&self) -> WorkerHealthSummary {
        WorkerHealthSummary::from_snapshots(&self.snapshots().await)
    }

    pub async fn total_count(&self) -> usize {
        self.shared.workers.read().await.len()
    }

    pub async fn available_count(&self) -> usize {
        let now = Instant::now();
        let count = self
            .shared
            .workers
            .read()
            .await
            .values()
            .filter(|w| w.is_available(now))
            .count();
        self.shared.metrics.set_available_workers(count);
        count
    }
}

impl RegistryShared {
    fn on_transition(self: &Arc<Self>, entry: &WorkerEntry, transition: CircuitTransition) {
        let CircuitTransition { from, to } = transition;
        match to {
            CircuitState::Open => warn!("Worker {} 熔断器打开 ({} -> {})", entry.id, from, to),
            _ => info!("Worker {} 熔断器状态 {} -> {}", entry.id, from, to),
        }
        self.metrics.record_breaker_transition(&to.to_string());
        self.events.publish(LifecycleEvent::BreakerTransition {
            worker_id: entry.id,
            from,
            to,
        });

        match to {
            CircuitState::Open => {
                self.schedule_half_open(
                    entry.id,
                    entry.breaker.generation(),
                    entry.breaker.current_reset_timeout(),
                );
            }
            CircuitState::HalfOpen | CircuitState::Closed => self.available.notify_one(),
        }
    }

    fn schedule_half_open(self: &Arc<Self>, id: WorkerId, generation: u64, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut workers = shared.workers.write().await;
            if let Some(entry) = workers.get_mut(&id) {
                if let Some(transition) = entry.breaker.try_half_open(generation) {
                    shared.on_transition(entry, transition);
                }
            }
        });
    }

    /// 按滑动窗口错误率重新分级，样本不足时保持不变
    fn evaluate_health(self: &Arc<Self>, entry: &mut WorkerEntry) {
        if !entry.health.accepts_work() || entry.outcomes.len() < self.config.health_min_samples {
            return;
        }
        let rate = entry.error_rate();
        if rate > self.config.failed_error_rate {
            self.mark_failed(entry, format!("错误率 {:.0}%", rate * 100.0));
            return;
        }
        let next = if rate >= self.config.degraded_error_rate {
            WorkerHealth::Degraded
        } else {
            WorkerHealth::Operational
        };
        if next != entry.health {
            self.set_health(entry, next, format!("错误率 {:.0}%", rate * 100.0));
        }
    }

    fn set_health(&self, entry: &mut WorkerEntry, next: WorkerHealth, reason: String) {
        let from = entry.health;
        entry.health = next;
        info!("Worker {} 健康状态 {} -> {} ({})", entry.id, from, next, reason);
        self.events.publish(LifecycleEvent::WorkerHealthChanged {
            worker_id: entry.id,
            from,
            to: next,
            reason,
        });
    }

    /// 标记失效，重启次数未用完时按退避安排重启
    fn mark_failed(self: &Arc<Self>, entry: &mut WorkerEntry, reason: String) {
        self.set_health(entry, WorkerHealth::Failed, reason);

        if entry.restart_attempts >= self.config.max_restart_attempts {
            error!(
                "Worker {} 已重启 {} 次，不再自动重启",
                entry.id, entry.restart_attempts
            );
            self.metrics.record_worker_restart("exhausted");
            self.events.publish(LifecycleEvent::WorkerRestartExhausted {
                worker_id: entry.id,
                attempts: entry.restart_attempts,
            });
            return;
        }

        let delay = self.config.restart_delay(entry.restart_attempts);
        entry.restart_attempts += 1;
        let attempt = entry.restart_attempts;
        self.set_health(entry, WorkerHealth::Restarting, format!("第 {attempt} 次重启"));
        self.metrics.record_worker_restart("scheduled");
        self.events.publish(LifecycleEvent::WorkerRestartScheduled {
            worker_id: entry.id,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let shared = Arc::clone(self);
        let id = entry.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.complete_restart(id, attempt).await;
        });
    }

    /// 重启完成：清空健康度窗口并刷新心跳，熔断器保持原状态
    async fn complete_restart(&self, id: WorkerId, attempt: u32) {
        {
            let mut workers = self.workers.write().await;
            let Some(entry) = workers.get_mut(&id) else {
                return;
            };
            if entry.health != WorkerHealth::Restarting || entry.restart_attempts != attempt {
                return;
            }
            entry.outcomes.clear();
            entry.last_heartbeat = Instant::now();
            self.set_health(entry, WorkerHealth::Operational, "重启完成".to_string());
            self.metrics.record_worker_restart("completed");
            self.events.publish(LifecycleEvent::WorkerRestarted {
                worker_id: id,
                attempt,
            });
        }
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_window_resets_after_window() {
        let mut window = RateWindow::new(RateLimitConfig {
            max_per_window: 2,
            window_secs: 60,
        });
        let start = window.started_at;
        window.consume(start);
        window.consume(start);
        assert!(!window.has_capacity(start));
        assert!(window.has_capacity(start + Duration::from_secs(60)));

        window.consume(start + Duration::from_secs(61));
        assert_eq!(window.used, 1);
    }
}
