//! Error types for Conductor.

use uuid::Uuid;

use crate::task::model::TaskStatus;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Decomposition error: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Validation errors — malformed tasks or descriptors, rejected before
/// anything is persisted.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Task title must not be empty")]
    EmptyTitle,

    #[error("Invalid capability tag: {tag}")]
    InvalidCapabilityTag { tag: String },

    #[error("Invalid subtask label: {label}")]
    InvalidLabel { label: String },

    #[error("Task input for type {task_type} is missing required key {key}")]
    MissingInputKey { task_type: String, key: String },

    #[error("Task input key {key} has the wrong shape: {expected}")]
    MalformedInputKey { key: String, expected: String },

    #[error("Dependency {id} does not refer to a known task")]
    UnknownDependency { id: Uuid },

    #[error("Task cannot depend on itself")]
    SelfDependency,

    #[error("Worker capacity must be at least 1")]
    ZeroCapacity,

    #[error("Worker name must not be empty")]
    EmptyWorkerName,
}

/// Decomposition errors — the whole batch is rejected atomically.
#[derive(Debug, thiserror::Error)]
pub enum DecompositionError {
    #[error("Descriptor batch is empty")]
    EmptyBatch,

    #[error("Duplicate subtask label in batch: {label}")]
    DuplicateLabel { label: String },

    #[error("Dependency label {label} resolves to no subtask or existing task")]
    UnresolvedLabel { label: String },

    #[error("Dependency cycle detected at {label}")]
    CycleDetected { label: String },

    #[error("Parent task {id} not found")]
    ParentNotFound { id: Uuid },

    #[error("Parent task {id} is {status}, cannot decompose")]
    ParentTerminal { id: Uuid, status: TaskStatus },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} is not assigned to worker {worker_id}")]
    NotAssignedToWorker { id: Uuid, worker_id: Uuid },

    #[error("Transition to {status} requires a worker id")]
    MissingWorker { status: TaskStatus },
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {id} not found")]
    NotFound { id: Uuid },

    #[error("Worker {id} is offline")]
    Offline { id: Uuid },

    #[error("Worker {id} is at capacity ({capacity})")]
    AtCapacity { id: Uuid, capacity: u32 },
}

/// Scheduler errors. These are recovered internally — a task without an
/// eligible worker simply stays Ready until one appears.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("No eligible worker for task {task_id}")]
    NoEligibleWorker { task_id: Uuid },
}

/// Checkpoint and recovery errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Task {task_id} is {status}, checkpoints require a running task")]
    TaskNotRunning { task_id: Uuid, status: TaskStatus },

    #[error("No checkpoint recorded for task {task_id}")]
    NoCheckpoint { task_id: Uuid },
}

/// Durable store errors. The store is the authority for optimistic-concurrency
/// conflict detection, surfaced as `VersionConflict`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: Uuid },

    #[error("{entity} {id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        entity: &'static str,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Cache backend errors. Any of these downgrades the cache layer to a no-op;
/// they never propagate past it.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unreachable: {0}")]
    Unavailable(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
