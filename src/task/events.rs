//! Task event bus.
//!
//! Every committed transition emits a `TaskEvent` on a broadcast channel.
//! Monitors and the notification fan-out collaborator subscribe; cache
//! invalidation does NOT ride this bus — it happens synchronously inside the
//! transition commit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::task::model::TaskStatus;

/// Default bus capacity. Slow subscribers lag, they don't block transitions.
const EVENT_CAPACITY: usize = 256;

/// An orchestration event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task transition committed.
    StatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        version: u64,
        reason: Option<String>,
    },
    /// A running task was asked to stop cooperatively.
    CancelRequested {
        task_id: Uuid,
        deadline: DateTime<Utc>,
    },
    /// A progress snapshot was persisted.
    CheckpointRecorded {
        task_id: Uuid,
        sequence: u64,
        attempt: u32,
    },
    /// A worker missed its liveness window and was marked offline.
    WorkerOffline { worker_id: Uuid },
}

/// Create the event bus.
pub fn event_bus() -> broadcast::Sender<TaskEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
