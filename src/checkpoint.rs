//! Checkpoint & recovery manager.
//!
//! Long-running tasks report resumable progress snapshots; after a worker
//! crash the system resumes from the latest snapshot instead of restarting
//! from zero. Checkpoints for a task are totally ordered by `sequence`
//! (atomic read-then-increment in the store) and carry the `attempt` they
//! were taken under, so recovery never resurrects progress from a previous
//! attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CheckpointError, Error, Result, TaskError};
use crate::store::StateStore;
use crate::task::events::TaskEvent;
use crate::task::manager::{TaskManager, TransitionPayload};
use crate::task::model::{FailureReason, TaskStatus};

/// A resumable progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint ID.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// The task attempt this snapshot belongs to.
    pub attempt: u32,
    /// Monotonically increasing per task.
    pub sequence: u64,
    /// Opaque progress payload: partial artifacts, sub-step index.
    pub snapshot: Value,
    pub created_at: DateTime<Utc>,
}

/// Snapshot-plus-elapsed view returned to status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub attempt: u32,
    /// Wall-clock time since the worker acknowledged start.
    pub elapsed: Option<Duration>,
    /// Latest recorded checkpoint, if any.
    pub checkpoint: Option<Checkpoint>,
}

/// Persists progress snapshots and drives recovery after worker failure.
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    tasks: Arc<TaskManager>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>, tasks: Arc<TaskManager>) -> Self {
        Self { store, tasks }
    }

    /// Append a progress snapshot for a running task.
    ///
    /// The task stays logically running; the first snapshot moves it to
    /// `Checkpointed` so status queries expose last-known progress.
    pub async fn create_checkpoint(&self, task_id: Uuid, snapshot: Value) -> Result<Checkpoint> {
        let task = self.tasks.get_task(task_id).await?;
        if !task.status.is_running_like() {
            return Err(CheckpointError::TaskNotRunning {
                task_id,
                status: task.status,
            }
            .into());
        }

        let checkpoint = self
            .store
            .append_checkpoint(task_id, task.attempt, snapshot)
            .await?;

        if task.status == TaskStatus::Running {
            match self
                .tasks
                .transition(
                    task_id,
                    task.version,
                    TaskStatus::Checkpointed,
                    TransitionPayload::with_reason("progress snapshot recorded"),
                )
                .await
            {
                Ok(_) => {}
                // The snapshot is durable either way; if the task moved on
                // concurrently the status mark is moot.
                Err(Error::Task(TaskError::VersionConflict { .. })) => {
                    debug!(task_id = %task_id, "Task moved during checkpoint, skipping status mark");
                }
                Err(e) => return Err(e),
            }
        }

        self.tasks.emit(TaskEvent::CheckpointRecorded {
            task_id,
            sequence: checkpoint.sequence,
            attempt: checkpoint.attempt,
        });
        Ok(checkpoint)
    }

    /// Latest progress for a status query.
    pub async fn task_progress(&self, task_id: Uuid) -> Result<TaskProgress> {
        let task = self.tasks.get_task(task_id).await?;
        let checkpoint = self.store.latest_checkpoint(task_id).await?;
        Ok(TaskProgress {
            task_id,
            status: task.status,
            attempt: task.attempt,
            elapsed: task.elapsed(),
            checkpoint,
        })
    }

    /// Re-queue every task owned by a worker declared Offline.
    ///
    /// Each counts as a failed attempt: retryable tasks re-enter Ready with
    /// the latest attempt-consistent snapshot attached to their input, the
    /// rest fail terminally and cascade. Replaying recovery is a no-op — a
    /// recovered task no longer lists the dead worker as its assignee.
    pub async fn recover_worker_tasks(&self, worker_id: Uuid) -> Result<usize> {
        let owned = self.store.list_worker_tasks(worker_id).await?;
        let mut recovered = 0;

        for task in owned {
            if !matches!(
                task.status,
                TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Checkpointed
            ) {
                continue;
            }

            let resume = self
                .store
                .latest_checkpoint(task.id)
                .await?
                .filter(|cp| cp.attempt == task.attempt)
                .map(|cp| cp.snapshot);

            match self
                .tasks
                .fail(
                    task.id,
                    FailureReason::WorkerLost,
                    "assigned worker went offline",
                    resume,
                )
                .await
            {
                Ok(_) => recovered += 1,
                // Another replica already recovered this task.
                Err(Error::Task(TaskError::VersionConflict { .. })) => {
                    debug!(task_id = %task.id, "Recovery lost a race, skipping");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Recovery failed for task");
                }
            }
        }

        if recovered > 0 {
            info!(worker_id = %worker_id, count = recovered, "Recovered tasks from offline worker");
        }
        Ok(recovered)
    }
}
