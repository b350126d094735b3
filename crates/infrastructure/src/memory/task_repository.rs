use std::collections::HashMap;

use async_trait::async_trait;
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::{Task, TaskId, TaskRepository, TaskStatus};
use tokio::sync::RwLock;

/// 内存任务仓储
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> OrchestratorResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(OrchestratorError::database_error(format!(
                "任务已存在: {}",
                task.id
            )));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update(&self, task: &Task) -> OrchestratorResult<()> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(OrchestratorError::task_not_found(task.id)),
        }
    }

    async fn find_by_id(&self, id: TaskId) -> OrchestratorResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn find_by_status(&self, status: TaskStatus) -> OrchestratorResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }
}
