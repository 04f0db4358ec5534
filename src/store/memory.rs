//! In-memory `StateStore` backend.
//!
//! Reference implementation for tests and single-process deployments. One
//! write lock over all tables makes the multi-row primitives
//! (`insert_tasks`, `update_task_and_worker`, `append_checkpoint`) genuinely
//! atomic, mirroring what a SQL backend does with transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::store::traits::StateStore;
use crate::task::model::{Task, TaskStatus};
use crate::workers::model::Worker;

#[derive(Default)]
struct Tables {
    tasks: HashMap<Uuid, Task>,
    workers: HashMap<Uuid, Worker>,
    checkpoints: HashMap<Uuid, Vec<Checkpoint>>,
}

impl Tables {
    fn check_task_version(&self, id: Uuid, expected: u64) -> Result<(), StoreError> {
        let stored = self.tasks.get(&id).ok_or(StoreError::NotFound {
            entity: "task",
            id,
        })?;
        if stored.version != expected {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id,
                expected,
                actual: stored.version,
            });
        }
        Ok(())
    }

    fn check_worker_version(&self, id: Uuid, expected: u64) -> Result<(), StoreError> {
        let stored = self.workers.get(&id).ok_or(StoreError::NotFound {
            entity: "worker",
            id,
        })?;
        if stored.version != expected {
            return Err(StoreError::VersionConflict {
                entity: "worker",
                id,
                expected,
                actual: stored.version,
            });
        }
        Ok(())
    }
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists {
                entity: "task",
                id: task.id,
            });
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        for task in tasks {
            if tables.tasks.contains_key(&task.id) {
                return Err(StoreError::AlreadyExists {
                    entity: "task",
                    id: task.id,
                });
            }
        }
        for task in tasks {
            tables.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task, expected_version: u64) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.check_task_version(task.id, expected_version)?;
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn list_dependents(&self, task_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.depends_on.contains(&task_id))
            .cloned()
            .collect())
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_worker_tasks(&self, worker_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.assigned_worker == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn update_task_and_worker(
        &self,
        task: &Task,
        expected_task_version: u64,
        worker: &Worker,
        expected_worker_version: u64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.check_task_version(task.id, expected_task_version)?;
        tables.check_worker_version(worker.id, expected_worker_version)?;
        tables.tasks.insert(task.id, task.clone());
        tables.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.workers.contains_key(&worker.id) {
            return Err(StoreError::AlreadyExists {
                entity: "worker",
                id: worker.id,
            });
        }
        tables.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError> {
        Ok(self.tables.read().await.workers.get(&id).cloned())
    }

    async fn update_worker(
        &self,
        worker: &Worker,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.check_worker_version(worker.id, expected_version)?;
        tables.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.tables.read().await.workers.values().cloned().collect())
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn append_checkpoint(
        &self,
        task_id: Uuid,
        attempt: u32,
        snapshot: Value,
    ) -> Result<Checkpoint, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.tasks.contains_key(&task_id) {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            });
        }
        let row = tables.checkpoints.entry(task_id).or_default();
        let sequence = row.last().map(|c| c.sequence + 1).unwrap_or(1);
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            task_id,
            attempt,
            sequence,
            snapshot,
            created_at: Utc::now(),
        };
        row.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest_checkpoint(&self, task_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(&task_id)
            .and_then(|row| row.last().cloned()))
    }

    async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .checkpoints
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn prune_checkpoints(&self, task_id: Uuid, keep: usize) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.checkpoints.get_mut(&task_id) else {
            return Ok(0);
        };
        if row.len() <= keep {
            return Ok(0);
        }
        let pruned = row.len() - keep;
        row.drain(..pruned);
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{TaskDraft, TaskType};
    use crate::workers::model::WorkerRegistration;

    fn task() -> Task {
        Task::from_draft(TaskDraft::new("t", TaskType::Testing, "tester")).unwrap()
    }

    #[tokio::test]
    async fn task_version_conflict() {
        let store = MemoryStore::new();
        let mut t = task();
        store.insert_task(&t).await.unwrap();

        t.advance(TaskStatus::Ready, Utc::now());
        store.update_task(&t, 0).await.unwrap();

        // Second writer with the stale version loses.
        let mut stale = t.clone();
        stale.version = 1;
        let err = store.update_task(&stale, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn batch_insert_is_atomic() {
        let store = MemoryStore::new();
        let existing = task();
        store.insert_task(&existing).await.unwrap();

        let fresh = task();
        let batch = vec![fresh.clone(), existing.clone()];
        assert!(store.insert_tasks(&batch).await.is_err());
        assert!(
            store.get_task(fresh.id).await.unwrap().is_none(),
            "no rows from a rejected batch may persist"
        );
    }

    #[tokio::test]
    async fn joint_update_checks_both_versions() {
        let store = MemoryStore::new();
        let t = task();
        let w =
            Worker::from_registration(WorkerRegistration::new("w", ["testing"], 1)).unwrap();
        store.insert_task(&t).await.unwrap();
        store.insert_worker(&w).await.unwrap();

        let mut t2 = t.clone();
        t2.advance(TaskStatus::Ready, Utc::now());
        let mut w2 = w.clone();
        w2.version += 1;

        assert!(
            store
                .update_task_and_worker(&t2, 0, &w2, 5)
                .await
                .is_err()
        );
        // Task row must be untouched after the failed joint commit.
        assert_eq!(store.get_task(t.id).await.unwrap().unwrap().version, 0);

        store
            .update_task_and_worker(&t2, 0, &w2, 0)
            .await
            .unwrap();
        assert_eq!(store.get_worker(w.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn checkpoint_sequences_are_monotonic() {
        let store = MemoryStore::new();
        let t = task();
        store.insert_task(&t).await.unwrap();

        for i in 0..4 {
            let cp = store
                .append_checkpoint(t.id, 0, serde_json::json!({ "step": i }))
                .await
                .unwrap();
            assert_eq!(cp.sequence, i + 1);
        }

        let latest = store.latest_checkpoint(t.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 4);

        let pruned = store.prune_checkpoints(t.id, 2).await.unwrap();
        assert_eq!(pruned, 2);
        let remaining = store.list_checkpoints(t.id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.last().unwrap().sequence, 4);
    }
}
