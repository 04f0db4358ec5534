//! Worker entity.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::task::model::{TaskType, is_valid_capability_tag};

/// Status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered, no assigned tasks.
    Idle,
    /// At least one assigned task, capacity remains.
    Busy,
    /// Finishing current tasks, accepting no new assignments.
    Draining,
    /// Missed the liveness window; tasks have been re-queued.
    Offline,
}

/// Per-task-type outcome counters, feeding the scheduler's historical
/// success-rate score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub succeeded: u64,
    pub failed: u64,
}

impl OutcomeStats {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// An execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker ID.
    pub id: Uuid,
    /// Human-readable identity for logs.
    pub name: String,
    /// Capability tags this worker can serve.
    pub capabilities: HashSet<String>,
    /// Maximum concurrent assigned tasks.
    pub capacity: u32,
    /// Currently assigned tasks. Only ever moves inside the same store commit
    /// that changes an assignment.
    pub current_load: u32,
    /// Current status.
    pub status: WorkerStatus,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// Optimistic-concurrency version for conditional worker updates.
    pub version: u64,
    /// Outcome history per task type.
    #[serde(default)]
    pub outcomes: HashMap<TaskType, OutcomeStats>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Create a worker row from a registration.
    pub fn from_registration(reg: WorkerRegistration) -> Result<Self, ValidationError> {
        reg.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: reg.name,
            capabilities: reg.capabilities,
            capacity: reg.capacity,
            current_load: 0,
            status: WorkerStatus::Idle,
            last_heartbeat: now,
            version: 0,
            outcomes: HashMap::new(),
            registered_at: now,
        })
    }

    /// Eligible for new assignments: Idle or Busy, spare capacity, and a
    /// heartbeat within the liveness window.
    pub fn is_eligible(&self, now: DateTime<Utc>, liveness_window: std::time::Duration) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy)
            && self.current_load < self.capacity
            && self.heartbeat_current(now, liveness_window)
    }

    /// Whether the last heartbeat falls within the liveness window.
    pub fn heartbeat_current(
        &self,
        now: DateTime<Utc>,
        liveness_window: std::time::Duration,
    ) -> bool {
        let window = ChronoDuration::from_std(liveness_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 1_000));
        now.signed_duration_since(self.last_heartbeat) <= window
    }

    /// Take one unit of load. Status follows the load.
    pub fn take_assignment(&mut self) {
        self.current_load = (self.current_load + 1).min(self.capacity);
        if self.status == WorkerStatus::Idle {
            self.status = WorkerStatus::Busy;
        }
    }

    /// Release one unit of load. Status follows the load unless the worker is
    /// Draining or Offline.
    pub fn release_assignment(&mut self) {
        self.current_load = self.current_load.saturating_sub(1);
        if self.current_load == 0 && self.status == WorkerStatus::Busy {
            self.status = WorkerStatus::Idle;
        }
    }

    /// Record a task outcome for scoring.
    pub fn record_outcome(&mut self, task_type: TaskType, success: bool) {
        let stats = self.outcomes.entry(task_type).or_default();
        if success {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }
    }

    /// Historical success rate for a task type. Workers with no history score
    /// a neutral 0.5.
    pub fn success_rate(&self, task_type: TaskType) -> f64 {
        match self.outcomes.get(&task_type) {
            Some(stats) if stats.total() > 0 => stats.succeeded as f64 / stats.total() as f64,
            _ => 0.5,
        }
    }
}

/// Registration request from a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: String,
    pub capabilities: HashSet<String>,
    pub capacity: u32,
}

impl WorkerRegistration {
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        capacity: u32,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            capacity,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyWorkerName);
        }
        if self.capacity == 0 {
            return Err(ValidationError::ZeroCapacity);
        }
        for tag in &self.capabilities {
            if !is_valid_capability_tag(tag) {
                return Err(ValidationError::InvalidCapabilityTag { tag: tag.clone() });
            }
        }
        Ok(())
    }
}
