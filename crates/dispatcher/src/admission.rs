//! 准入控制
//!
//! 在途请求数不超过 `max_in_flight`；超出时按优先级排队等待，
//! 排队超时返回 [`OrchestratorError::AdmissionTimeout`]。资源压力超过阈值时
//! 暂停放行与出队，压力回落后继续。活跃调用方低于下限时暂停非关键Worker类别，
//! 豁免类别始终不受影响。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use orchestrator_core::{AdmissionConfig, OrchestratorError, OrchestratorResult};
use orchestrator_domain::{ResourceMetricsSource, ResourceSnapshot, TaskPriority};
use orchestrator_infrastructure::MetricsCollector;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// 准入结果
#[derive(Debug)]
pub enum AdmissionDecision {
    Proceed(AdmissionPermit),
    Queued(AdmissionTicket),
    Rejected(String),
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Proceed(_) => "proceed",
            AdmissionDecision::Queued(_) => "queued",
            AdmissionDecision::Rejected(_) => "rejected",
        }
    }

    /// 放行或等待放行，拒绝时返回 [`OrchestratorError::AdmissionRejected`]
    pub async fn into_permit(self) -> OrchestratorResult<AdmissionPermit> {
        match self {
            AdmissionDecision::Proceed(permit) => Ok(permit),
            AdmissionDecision::Queued(ticket) => ticket.wait().await,
            AdmissionDecision::Rejected(reason) => Err(OrchestratorError::AdmissionRejected(reason)),
        }
    }
}

/// 在途名额，释放时唤醒等待者
#[derive(Debug)]
pub struct AdmissionPermit {
    shared: Arc<AdmissionShared>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// 排队凭据
#[derive(Debug)]
pub struct AdmissionTicket {
    receiver: oneshot::Receiver<AdmissionPermit>,
    timeout: std::time::Duration,
    priority: TaskPriority,
}

impl AdmissionTicket {
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub async fn wait(self) -> OrchestratorResult<AdmissionPermit> {
        match tokio::time::timeout(self.timeout, self.receiver).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(OrchestratorError::AdmissionRejected(
                "准入控制器已关闭".to_string(),
            )),
            Err(_) => {
                debug!("排队等待超时 (优先级: {})", self.priority.as_str());
                Err(OrchestratorError::AdmissionTimeout)
            }
        }
    }
}

#[derive(Debug)]
struct Waiter {
    priority: TaskPriority,
    sequence: u64,
    sender: oneshot::Sender<AdmissionPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Waiter {}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    in_flight: usize,
    waiters: BinaryHeap<Waiter>,
    next_sequence: u64,
    throttled: bool,
    paused_categories: HashSet<String>,
    last_snapshot: Option<ResourceSnapshot>,
}

#[derive(Debug)]
struct AdmissionShared {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
    metrics: MetricsCollector,
}

impl AdmissionShared {
    fn release(self: &Arc<Self>) {
        let undelivered = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.drain(&mut state)
        };
        // 等待者已离开时名额随之释放，必须在锁外析构
        drop(undelivered);
    }

    /// 按优先级把空出的名额交给等待者，返回未能送达的名额
    fn drain(self: &Arc<Self>, state: &mut AdmissionState) -> Vec<AdmissionPermit> {
        let mut undelivered = Vec::new();
        while !state.throttled && state.in_flight < self.config.max_in_flight {
            let Some(waiter) = state.waiters.pop() else {
                break;
            };
            if waiter.sender.is_closed() {
                continue;
            }
            state.in_flight += 1;
            let permit = AdmissionPermit {
                shared: Arc::clone(self),
            };
            if let Err(permit) = waiter.sender.send(permit) {
                undelivered.push(permit);
            }
        }
        self.metrics.set_admission_waiters(state.waiters.len());
        undelivered
    }
}

/// 准入控制器
#[derive(Debug, Clone)]
pub struct AdmissionController {
    shared: Arc<AdmissionShared>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            shared: Arc::new(AdmissionShared {
                config,
                state: Mutex::new(AdmissionState::default()),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    pub fn admit(&self, priority: TaskPriority) -> AdmissionDecision {
        let decision = {
            let mut state = self.shared.state.lock();
            if !state.throttled && state.in_flight < self.shared.config.max_in_flight {
                state.in_flight += 1;
                AdmissionDecision::Proceed(AdmissionPermit {
                    shared: Arc::clone(&self.shared),
                })
            } else {
                state.waiters.retain(|w| !w.sender.is_closed());
                if state.waiters.len() >= self.shared.config.max_queue_size {
                    warn!(
                        "等待队列已满 ({}), 拒绝优先级 {} 的请求",
                        state.waiters.len(),
                        priority.as_str()
                    );
                    AdmissionDecision::Rejected("等待队列已满".to_string())
                } else {
                    let (sender, receiver) = oneshot::channel();
                    let sequence = state.next_sequence;
                    state.next_sequence += 1;
                    state.waiters.push(Waiter {
                        priority,
                        sequence,
                        sender,
                    });
                    self.shared.metrics.set_admission_waiters(state.waiters.len());
                    AdmissionDecision::Queued(AdmissionTicket {
                        receiver,
                        timeout: self.shared.config.queue_timeout(),
                        priority,
                    })
                }
            }
        };
        self.shared.metrics.record_admission(decision.as_str());
        decision
    }

    /// 根据资源快照更新压力暂停和降级状态
    pub fn update_metrics(&self, snapshot: ResourceSnapshot) {
        let config = &self.shared.config;
        let throttled = snapshot.cpu_percent >= config.cpu_threshold_percent
            || snapshot.memory_percent >= config.memory_threshold_percent;

        let paused: HashSet<String> = if config.degradation.enabled
            && snapshot.active_connections < config.degradation.active_caller_floor
        {
            config
                .degradation
                .non_critical_categories
                .iter()
                .filter(|c| !config.degradation.exempt_categories.contains(c))
                .cloned()
                .collect()
        } else {
            HashSet::new()
        };

        let mut state = self.shared.state.lock();
        if throttled != state.throttled {
            if throttled {
                warn!(
                    "资源压力过高 (CPU: {:.1}%, 内存: {:.1}%)，暂停准入",
                    snapshot.cpu_percent, snapshot.memory_percent
                );
            } else {
                info!(
                    "资源压力回落 (CPU: {:.1}%, 内存: {:.1}%)，恢复准入",
                    snapshot.cpu_percent, snapshot.memory_percent
                );
            }
            state.throttled = throttled;
        }
        if paused != state.paused_categories {
            if paused.is_empty() {
                info!("活跃调用方恢复到 {}，解除降级", snapshot.active_connections);
            } else {
                warn!(
                    "活跃调用方 {} 低于下限 {}，暂停类别: {:?}",
                    snapshot.active_connections, config.degradation.active_caller_floor, paused
                );
            }
            state.paused_categories = paused;
        }
        state.last_snapshot = Some(snapshot);

        let undelivered = self.shared.drain(&mut state);
        drop(state);
        drop(undelivered);
    }

    pub fn is_throttled(&self) -> bool {
        self.shared.state.lock().throttled
    }

    pub fn paused_categories(&self) -> HashSet<String> {
        self.shared.state.lock().paused_categories.clone()
    }

    pub fn is_category_paused(&self, category: &str) -> bool {
        self.shared.state.lock().paused_categories.contains(category)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    pub fn waiting(&self) -> usize {
        self.shared
            .state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.sender.is_closed())
            .count()
    }

    pub fn last_snapshot(&self) -> Option<ResourceSnapshot> {
        self.shared.state.lock().last_snapshot.clone()
    }

    /// 周期性采样资源指标，采样失败时保持上一次的状态
    pub async fn run_sampler(
        &self,
        source: Arc<dyn ResourceMetricsSource>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.shared.config.sample_interval());
        info!("启动资源采样循环");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match source.snapshot().await {
                        Ok(snapshot) => self.update_metrics(snapshot),
                        Err(e) => warn!("资源指标采样失败: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出资源采样循环");
                    break;
                }
            }
        }
    }
}
