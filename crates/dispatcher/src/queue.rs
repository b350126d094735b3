//! 待分配任务队列
//!
//! 按 (优先级降序, 到达序号升序) 出队。重试的任务保留原序号重新入队。

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use orchestrator_domain::{TaskId, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub sequence: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority, sequence: u64) {
        self.heap.push(QueueEntry {
            task_id,
            priority,
            sequence,
        });
    }

    pub fn push_entry(&mut self, entry: QueueEntry) {
        self.heap.push(entry);
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_first() {
        let mut queue = TaskQueue::new();
        let low = TaskId::new();
        let critical = TaskId::new();
        let medium = TaskId::new();
        queue.push(low, TaskPriority::Low, 1);
        queue.push(critical, TaskPriority::Critical, 2);
        queue.push(medium, TaskPriority::Medium, 3);

        let order: Vec<TaskId> = std::iter::from_fn(|| queue.pop().map(|e| e.task_id)).collect();
        assert_eq!(order, vec![critical, medium, low]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = TaskQueue::new();
        let ids: Vec<TaskId> = (0..5).map(|_| TaskId::new()).collect();
        for (seq, id) in ids.iter().enumerate().rev() {
            queue.push(*id, TaskPriority::High, seq as u64);
        }
        let order: Vec<TaskId> = std::iter::from_fn(|| queue.pop().map(|e| e.task_id)).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_requeued_entry_keeps_its_place() {
        let mut queue = TaskQueue::new();
        let first = TaskId::new();
        let second = TaskId::new();
        queue.push(second, TaskPriority::Medium, 8);
        let requeued = QueueEntry {
            task_id: first,
            priority: TaskPriority::Medium,
            sequence: 3,
        };
        queue.push_entry(requeued);
        assert_eq!(queue.peek().map(|e| e.task_id), Some(first));
        assert_eq!(queue.len(), 2);
    }
}
