//! Unified `StateStore` trait — single async interface for all durable state.
//!
//! The durable store collaborator implements this; `MemoryStore` is the
//! in-tree reference backend. Every write primitive takes the version the
//! caller read (`expected_version`) and fails with
//! [`StoreError::VersionConflict`] when the stored row has moved on — the
//! store is the authority for optimistic-concurrency conflict detection. A
//! SQL backend implements that as `UPDATE … WHERE id = ? AND version = ?`
//! with an affected-rows check.
//!
//! Callers pass rows with the version already bumped; the store compares the
//! *stored* version against `expected_version` and writes the row verbatim.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::task::model::{Task, TaskStatus};
use crate::workers::model::Worker;

/// Backend-agnostic state store covering tasks, workers, and checkpoints.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task row.
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Insert a batch of tasks atomically — all rows or none.
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Conditionally update a task row.
    async fn update_task(&self, task: &Task, expected_version: u64) -> Result<(), StoreError>;

    /// All tasks currently in `status`.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

    /// Tasks whose `depends_on` contains `task_id`.
    async fn list_dependents(&self, task_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Direct children (tasks whose `parent_id` is `parent_id`).
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Tasks currently assigned to a worker.
    async fn list_worker_tasks(&self, worker_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Conditionally update a task and a worker row in one commit. Used for
    /// assignment and release so task status and worker load never drift.
    async fn update_task_and_worker(
        &self,
        task: &Task,
        expected_task_version: u64,
        worker: &Worker,
        expected_worker_version: u64,
    ) -> Result<(), StoreError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Insert a new worker row.
    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError>;

    /// Get a worker by ID.
    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError>;

    /// Conditionally update a worker row.
    async fn update_worker(&self, worker: &Worker, expected_version: u64)
    -> Result<(), StoreError>;

    /// All registered workers.
    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Append a checkpoint with the next per-task sequence number. The
    /// read-then-increment is atomic against the store, so sequences are
    /// totally ordered even under concurrent progress reports.
    async fn append_checkpoint(
        &self,
        task_id: Uuid,
        attempt: u32,
        snapshot: Value,
    ) -> Result<Checkpoint, StoreError>;

    /// The highest-sequence checkpoint for a task.
    async fn latest_checkpoint(&self, task_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// All checkpoints for a task, ordered by sequence.
    async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, StoreError>;

    /// Drop all but the newest `keep` checkpoints for a task. Returns how
    /// many were pruned.
    async fn prune_checkpoints(&self, task_id: Uuid, keep: usize) -> Result<usize, StoreError>;
}
