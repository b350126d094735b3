use orchestrator_domain::WorkerId;

/// 选择时参与比较的Worker信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCandidate {
    pub id: WorkerId,
    pub current_load: u32,
    pub capacity: u32,
}

impl WorkerCandidate {
    /// 负载率比较，交叉相乘避免浮点误差
    fn load_cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = u64::from(self.current_load) * u64::from(other.capacity);
        let rhs = u64::from(other.current_load) * u64::from(self.capacity);
        lhs.cmp(&rhs)
    }
}

/// Worker选择策略
///
/// 在注册表锁内同步调用，候选列表已经过可用性过滤。
pub trait WorkerSelectionStrategy: Send + Sync {
    fn select(&self, candidates: &[WorkerCandidate]) -> Option<WorkerId>;

    fn name(&self) -> &'static str;
}

/// 负载率最低者优先，负载率相同时取编号最小的Worker
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerSelectionStrategy for LeastLoadedStrategy {
    fn select(&self, candidates: &[WorkerCandidate]) -> Option<WorkerId> {
        candidates
            .iter()
            .min_by(|a, b| a.load_cmp(b).then_with(|| a.id.cmp(&b.id)))
            .map(|c| c.id)
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }
}
