use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::OrchestratorResult;
use orchestrator_domain::{
    ClaimOutcome, ExecutionRecord, ExecutionRecordRepository, ExecutionStatus, JobId, TaskKind,
};
use tokio::sync::RwLock;
use tracing::debug;

const DEFAULT_RETENTION: usize = 10_000;

#[derive(Default)]
struct RecordStore {
    records: HashMap<JobId, ExecutionRecord>,
    by_key: HashMap<String, Vec<JobId>>,
    /// 写入顺序，用于淘汰
    order: VecDeque<JobId>,
    /// 最近一次认领使用的去重窗口起点
    window_start: Option<DateTime<Utc>>,
}

impl RecordStore {
    fn insert(&mut self, record: &ExecutionRecord) {
        if self.records.insert(record.job_id, record.clone()).is_none() {
            self.by_key
                .entry(record.idempotency_key.clone())
                .or_default()
                .push(record.job_id);
            self.order.push_back(record.job_id);
        }
    }

    fn remove(&mut self, job_id: JobId) {
        let Some(record) = self.records.remove(&job_id) else {
            return;
        };
        if let Some(ids) = self.by_key.get_mut(&record.idempotency_key) {
            ids.retain(|id| *id != job_id);
            if ids.is_empty() {
                self.by_key.remove(&record.idempotency_key);
            }
        }
    }

    /// 超出保留数量时按写入顺序淘汰去重窗口之外的已结束记录
    fn prune(&mut self, retention: usize) {
        let Some(window_start) = self.window_start else {
            return;
        };
        let mut excess = self.records.len().saturating_sub(retention);
        if excess == 0 {
            return;
        }
        let mut kept = VecDeque::with_capacity(self.order.len());
        while let Some(job_id) = self.order.pop_front() {
            let evictable = self.records.get(&job_id).is_some_and(|r| {
                r.status != ExecutionStatus::InProgress && r.created_at < window_start
            });
            if evictable {
                self.remove(job_id);
                excess -= 1;
                if excess == 0 {
                    break;
                }
            } else if self.records.contains_key(&job_id) {
                kept.push_back(job_id);
            }
        }
        kept.append(&mut self.order);
        self.order = kept;
        debug!(remaining = self.records.len(), "执行记录已淘汰");
    }
}

/// 内存执行记录仓储。认领在同一把写锁内完成查重与写入
///
/// 记录按幂等键索引。总数超过保留上限后，去重窗口之外的已结束记录按写入顺序淘汰，
/// 进行中的记录不会被淘汰。
pub struct InMemoryExecutionRecordRepository {
    store: RwLock<RecordStore>,
    retention: usize,
}

impl Default for InMemoryExecutionRecordRepository {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl InMemoryExecutionRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            store: RwLock::new(RecordStore::default()),
            retention: retention.max(1),
        }
    }

    /// 某个幂等键下的全部记录
    pub async fn records_for_key(&self, key: &str) -> Vec<ExecutionRecord> {
        let store = self.store.read().await;
        let mut records: Vec<ExecutionRecord> = store
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| store.records.get(id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.records.len()
    }
}

#[async_trait]
impl ExecutionRecordRepository for InMemoryExecutionRecordRepository {
    async fn claim(
        &self,
        record: &ExecutionRecord,
        since: DateTime<Utc>,
    ) -> OrchestratorResult<ClaimOutcome> {
        let mut store = self.store.write().await;
        let existing = store
            .by_key
            .get(&record.idempotency_key)
            .into_iter()
            .flatten()
            .filter_map(|id| store.records.get(id))
            .filter(|r| r.created_at >= since && r.status.blocks_duplicates())
            .max_by_key(|r| r.created_at)
            .cloned();

        if let Some(existing) = existing {
            return Ok(ClaimOutcome::Existing(existing));
        }
        store.window_start = Some(since);
        store.insert(record);
        store.prune(self.retention);
        Ok(ClaimOutcome::Claimed)
    }

    async fn update(&self, record: &ExecutionRecord) -> OrchestratorResult<()> {
        let mut store = self.store.write().await;
        if let Some(existing) = store.records.get_mut(&record.job_id) {
            *existing = record.clone();
            return Ok(());
        }
        // 跳过去重的执行也需要落库
        store.insert(record);
        store.prune(self.retention);
        Ok(())
    }

    async fn find_by_job_id(&self, job_id: JobId) -> OrchestratorResult<Option<ExecutionRecord>> {
        Ok(self.store.read().await.records.get(&job_id).cloned())
    }

    async fn recent_by_kind(
        &self,
        kind: TaskKind,
        limit: usize,
    ) -> OrchestratorResult<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .store
            .read()
            .await
            .records
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(key: &str, age_secs: i64) -> ExecutionRecord {
        let mut record = ExecutionRecord::in_progress(key.to_string(), TaskKind::PaymentProcessing);
        record.created_at = Utc::now() - chrono::Duration::seconds(age_secs);
        record.succeed(serde_json::json!({}), 1);
        record
    }

    #[tokio::test]
    async fn test_claim_finds_existing_record_by_key() {
        let repo = InMemoryExecutionRecordRepository::new();
        let since = Utc::now() - chrono::Duration::seconds(60);
        let first = ExecutionRecord::in_progress("k1".into(), TaskKind::PaymentProcessing);
        assert_eq!(repo.claim(&first, since).await.unwrap(), ClaimOutcome::Claimed);

        let other = ExecutionRecord::in_progress("k2".into(), TaskKind::PaymentProcessing);
        assert_eq!(repo.claim(&other, since).await.unwrap(), ClaimOutcome::Claimed);

        let again = ExecutionRecord::in_progress("k1".into(), TaskKind::PaymentProcessing);
        match repo.claim(&again, since).await.unwrap() {
            ClaimOutcome::Existing(existing) => assert_eq!(existing.job_id, first.job_id),
            ClaimOutcome::Claimed => panic!("duplicate key was claimed twice"),
        }
        assert_eq!(repo.records_for_key("k1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_prunes_finished_records_outside_window() {
        let repo = InMemoryExecutionRecordRepository::with_retention(2);
        for (i, age) in [600, 500, 400].into_iter().enumerate() {
            repo.update(&finished(&format!("old-{i}"), age)).await.unwrap();
        }
        let stale_in_flight = {
            let mut record =
                ExecutionRecord::in_progress("stuck".into(), TaskKind::PaymentProcessing);
            record.created_at = Utc::now() - chrono::Duration::seconds(700);
            record
        };
        repo.update(&stale_in_flight).await.unwrap();

        let since = Utc::now() - chrono::Duration::seconds(60);
        let fresh = ExecutionRecord::in_progress("fresh".into(), TaskKind::PaymentProcessing);
        assert_eq!(repo.claim(&fresh, since).await.unwrap(), ClaimOutcome::Claimed);

        assert_eq!(repo.len().await, 2);
        assert!(repo.records_for_key("old-0").await.is_empty());
        assert!(repo.records_for_key("old-2").await.is_empty());
        assert_eq!(repo.records_for_key("stuck").await.len(), 1);
        assert_eq!(repo.records_for_key("fresh").await.len(), 1);
    }

    #[tokio::test]
    async fn test_records_inside_window_are_kept() {
        let repo = InMemoryExecutionRecordRepository::with_retention(1);
        let since = Utc::now() - chrono::Duration::seconds(300);
        repo.update(&finished("recent", 10)).await.unwrap();

        let fresh = ExecutionRecord::in_progress("fresh".into(), TaskKind::PaymentProcessing);
        repo.claim(&fresh, since).await.unwrap();

        assert_eq!(repo.len().await, 2);
        let again = ExecutionRecord::in_progress("recent".into(), TaskKind::PaymentProcessing);
        assert!(matches!(
            repo.claim(&again, since).await.unwrap(),
            ClaimOutcome::Existing(_)
        ));
    }
}
