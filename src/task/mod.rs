//! Task model — the entity and state machine shared by all components.
//!
//! Core components:
//! - `model` — Task entity, status state machine, drafts, results
//! - `events` — broadcast bus of transition events
//! - `manager` — the single mutation gateway (optimistic-concurrency
//!   transitions, dependent promotion, cascades, cancellation)

pub mod events;
pub mod manager;
pub mod model;

pub use events::TaskEvent;
pub use manager::{TaskManager, TransitionPayload};
pub use model::{
    FailureReason, Task, TaskDraft, TaskInput, TaskPriority, TaskResult, TaskStatus, TaskType,
};
