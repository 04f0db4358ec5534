//! Task entity and state machine.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet all satisfied.
    Pending,
    /// All dependencies completed; eligible for assignment.
    Ready,
    /// Exclusively bound to one worker; not yet started.
    Assigned,
    /// Worker has acknowledged start.
    Running,
    /// A progress snapshot exists; logically still running.
    Checkpointed,
    /// Work finished successfully.
    Completed,
    /// Work failed. Re-enterable via retry while attempts remain.
    Failed,
    /// Work was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Ready) | (Pending, Cancelled) |
            // From Ready
            (Ready, Assigned) | (Ready, Cancelled) |
            // From Assigned (Failed covers a worker lost before start)
            (Assigned, Running) | (Assigned, Failed) | (Assigned, Cancelled) |
            // From Running
            (Running, Checkpointed) | (Running, Completed) |
            (Running, Failed) | (Running, Cancelled) |
            // From Checkpointed (logically still running)
            (Checkpointed, Running) | (Checkpointed, Completed) |
            (Checkpointed, Failed) | (Checkpointed, Cancelled) |
            // Retry loop; a failed task awaiting retry can still be cancelled
            (Failed, Ready) | (Failed, Cancelled)
        )
    }

    /// Check if this is a terminal state. Failed is terminal once the retry
    /// budget is exhausted; the `Failed → Ready` edge re-enters it otherwise.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Running or Checkpointed — a checkpointed task counts as running for
    /// scheduling, timeout, and recovery purposes.
    pub fn is_running_like(&self) -> bool {
        matches!(self, Self::Running | Self::Checkpointed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Kind of work a task represents. Maps to a base capability tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Planning,
    CodeGeneration,
    CodeEdit,
    Testing,
    Debugging,
    Review,
    Documentation,
    Research,
}

impl TaskType {
    /// The capability tag a worker must carry to run this kind of task.
    pub fn base_capability(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::CodeGeneration => "code_generation",
            Self::CodeEdit => "code_edit",
            Self::Testing => "testing",
            Self::Debugging => "debugging",
            Self::Review => "review",
            Self::Documentation => "documentation",
            Self::Research => "research",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_capability())
    }
}

/// Priority band. Ordered: Low < Normal < High < Critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Why a task ended up terminally Failed or Cancelled. Recorded in the result
/// payload — the only error taxonomy values callers see as outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The agent reported an execution failure.
    ExecutionError,
    /// The owning worker went offline mid-run.
    WorkerLost,
    /// `max_run_duration` was exceeded.
    Timeout,
    /// A dependency failed terminally.
    UpstreamFailure,
    /// The retry budget ran out.
    RetriesExhausted,
    /// Cancelled by the caller or by parent cancellation.
    Cancelled,
}

/// Outcome of an executed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the work succeeded.
    pub success: bool,
    /// Output map interpreted by downstream agents.
    #[serde(default)]
    pub output: Map<String, Value>,
    /// Produced artifact references (file paths, URLs).
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Execution metrics (token counts, tool invocations, ...).
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Failure taxonomy value, present on failed/cancelled outcomes.
    pub failure: Option<FailureReason>,
    /// Human-readable error detail.
    pub error: Option<String>,
}

impl TaskResult {
    /// Successful result with an output map.
    pub fn success(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    /// Failed result carrying the originating taxonomy value.
    pub fn failure(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            success: false,
            failure: Some(reason),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Input payload keys with a defined shape.
const KEY_FILES: &str = "files";
const KEY_CAPABILITIES: &str = "capabilities";
const KEY_RESUME_SNAPSHOT: &str = "resume_snapshot";

/// Schema-checked key-value input payload.
///
/// Well-known keys (`files`, `capabilities`, `resume_snapshot`) have their
/// shape validated up front so malformed agent output is caught at
/// decomposition time, not at execution time. Everything else is opaque to the
/// orchestrator and interpreted by the executing agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskInput(Map<String, Value>);

impl TaskInput {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// File paths this task touches, if declared.
    pub fn files(&self) -> Vec<&str> {
        self.0
            .get(KEY_FILES)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Explicit capability tags declared in the payload.
    pub fn capability_tags(&self) -> Vec<String> {
        self.0
            .get(KEY_CAPABILITIES)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Checkpoint snapshot attached for resumption after recovery.
    pub fn resume_snapshot(&self) -> Option<&Value> {
        self.0.get(KEY_RESUME_SNAPSHOT)
    }

    /// Attach a checkpoint snapshot for the next assignment to resume from.
    pub fn set_resume_snapshot(&mut self, snapshot: Value) {
        self.0.insert(KEY_RESUME_SNAPSHOT.to_string(), snapshot);
    }

    /// Approximate serialized size in bytes, for the splitting heuristic.
    pub fn approx_size(&self) -> usize {
        serde_json::to_string(&self.0).map(|s| s.len()).unwrap_or(0)
    }

    /// Validate the payload shape for a task type.
    pub fn validate_for(&self, task_type: TaskType) -> Result<(), ValidationError> {
        for (key, expected) in [
            (KEY_FILES, "array of strings"),
            (KEY_CAPABILITIES, "array of strings"),
        ] {
            if let Some(value) = self.0.get(key) {
                let ok = value
                    .as_array()
                    .is_some_and(|a| a.iter().all(Value::is_string));
                if !ok {
                    return Err(ValidationError::MalformedInputKey {
                        key: key.to_string(),
                        expected: expected.to_string(),
                    });
                }
            }
        }

        // Edits without target files cannot be routed to a sandbox.
        if task_type == TaskType::CodeEdit && self.files().is_empty() {
            return Err(ValidationError::MissingInputKey {
                task_type: task_type.to_string(),
                key: KEY_FILES.to_string(),
            });
        }

        Ok(())
    }
}

/// A unit of work with declared dependencies, capabilities, and a lifecycle
/// state. Mutated exclusively through the task manager's transition API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: Uuid,
    /// Parent task, set when created by decomposition.
    pub parent_id: Option<Uuid>,
    /// Originating agent or user id.
    pub created_by: String,
    /// Short title.
    pub title: String,
    /// Requirement text handed to the executing agent.
    pub description: String,
    /// Kind of work.
    pub task_type: TaskType,
    /// Priority band.
    pub priority: TaskPriority,
    /// Tasks that must complete before this one is Ready.
    pub depends_on: HashSet<Uuid>,
    /// Capability tags declared at creation.
    pub required_capabilities: HashSet<String>,
    /// When true, a terminally failed dependency is dropped from the wait set
    /// instead of cancelling this task.
    pub allow_partial_upstream: bool,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Worker exclusively bound to this task, if any.
    pub assigned_worker: Option<Uuid>,
    /// Retry counter.
    pub attempt: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Cooperative-cancellation request timestamp.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Opaque input payload.
    pub input: TaskInput,
    /// Outcome, present once terminal.
    pub result: Option<TaskResult>,
    /// Declared estimate.
    pub estimated_duration: Option<Duration>,
    /// Measured wall-clock duration, set on completion.
    pub actual_duration: Option<Duration>,
    /// Hard run deadline; exceeding it while running is a failure.
    pub max_run_duration: Option<Duration>,
    /// Optimistic-concurrency version, incremented on every committed
    /// transition.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the worker acknowledged start.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task from a draft, validating it first.
    pub fn from_draft(draft: TaskDraft) -> Result<Self, ValidationError> {
        draft.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            parent_id: draft.parent_id,
            created_by: draft.created_by,
            title: draft.title,
            description: draft.description,
            task_type: draft.task_type,
            priority: draft.priority,
            depends_on: draft.depends_on,
            required_capabilities: draft.required_capabilities,
            allow_partial_upstream: draft.allow_partial_upstream,
            status: TaskStatus::Pending,
            assigned_worker: None,
            attempt: 0,
            max_retries: draft.max_retries,
            cancel_requested_at: None,
            input: draft.input,
            result: None,
            estimated_duration: draft.estimated_duration,
            actual_duration: None,
            max_run_duration: draft.max_run_duration,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    /// Apply a status change: set the new status, stamp timestamps, bump the
    /// version. Legality of the edge is the manager's concern.
    pub fn advance(&mut self, new_status: TaskStatus, now: DateTime<Utc>) {
        if new_status == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if new_status.is_terminal() {
            self.completed_at = Some(now);
            if let Some(started) = self.started_at {
                let elapsed = now.signed_duration_since(started);
                self.actual_duration =
                    Some(Duration::from_secs(elapsed.num_seconds().max(0) as u64));
            }
        }
        self.status = new_status;
        self.updated_at = now;
        self.version += 1;
    }

    /// Elapsed wall-clock time since start, if started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            let elapsed = end.signed_duration_since(start);
            Duration::from_secs(elapsed.num_seconds().max(0) as u64)
        })
    }

    /// Whether the run deadline has been exceeded.
    pub fn overran_deadline(&self, now: DateTime<Utc>) -> bool {
        match (self.max_run_duration, self.started_at) {
            (Some(max), Some(started)) => {
                now.signed_duration_since(started).num_seconds().max(0) as u64 > max.as_secs()
            }
            _ => false,
        }
    }

    /// Whether a retry attempt remains.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }
}

/// Draft of a task prior to persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_by: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub depends_on: HashSet<Uuid>,
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    #[serde(default)]
    pub allow_partial_upstream: bool,
    #[serde(default)]
    pub input: TaskInput,
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
    #[serde(default)]
    pub max_run_duration: Option<Duration>,
    #[serde(default = "TaskDraft::default_max_retries")]
    pub max_retries: u32,
}

impl TaskDraft {
    fn default_max_retries() -> u32 {
        1
    }

    /// Minimal draft for a given type.
    pub fn new(title: impl Into<String>, task_type: TaskType, created_by: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::default(),
            created_by: created_by.into(),
            parent_id: None,
            depends_on: HashSet::new(),
            required_capabilities: HashSet::new(),
            allow_partial_upstream: false,
            input: TaskInput::new(),
            estimated_duration: None,
            max_run_duration: None,
            max_retries: Self::default_max_retries(),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        for tag in &self.required_capabilities {
            if !is_valid_capability_tag(tag) {
                return Err(ValidationError::InvalidCapabilityTag { tag: tag.clone() });
            }
        }
        self.input.validate_for(self.task_type)?;
        Ok(())
    }
}

/// Capability tags are lowercase identifiers: `code_generation`, `go_test`.
pub fn is_valid_capability_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> TaskDraft {
        TaskDraft::new("Generate parser", TaskType::CodeGeneration, "planner-1")
    }

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Checkpointed));
        assert!(TaskStatus::Checkpointed.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Checkpointed.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Ready));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Assigned));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Ready.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Checkpointed.is_terminal());
        assert!(TaskStatus::Checkpointed.is_running_like());
    }

    #[test]
    fn from_draft_starts_pending() {
        let task = Task::from_draft(draft()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.version, 0);
        assert_eq!(task.attempt, 0);
        assert!(task.result.is_none());
    }

    #[test]
    fn empty_title_rejected() {
        let mut d = draft();
        d.title = "  ".to_string();
        assert!(matches!(
            Task::from_draft(d),
            Err(ValidationError::EmptyTitle)
        ));
    }

    #[test]
    fn bad_capability_tag_rejected() {
        let mut d = draft();
        d.required_capabilities.insert("Go Build!".to_string());
        assert!(matches!(
            Task::from_draft(d),
            Err(ValidationError::InvalidCapabilityTag { .. })
        ));
    }

    #[test]
    fn code_edit_requires_files() {
        let mut d = TaskDraft::new("Patch config", TaskType::CodeEdit, "planner-1");
        assert!(matches!(
            Task::from_draft(d.clone()),
            Err(ValidationError::MissingInputKey { .. })
        ));

        d.input
            .insert("files", serde_json::json!(["src/config.rs"]));
        assert!(Task::from_draft(d).is_ok());
    }

    #[test]
    fn malformed_files_key_rejected() {
        let mut d = draft();
        d.input.insert("files", serde_json::json!("not-an-array"));
        assert!(matches!(
            Task::from_draft(d),
            Err(ValidationError::MalformedInputKey { .. })
        ));
    }

    #[test]
    fn advance_stamps_and_bumps_version() {
        let mut task = Task::from_draft(draft()).unwrap();
        let now = Utc::now();
        task.advance(TaskStatus::Ready, now);
        task.advance(TaskStatus::Assigned, now);
        task.advance(TaskStatus::Running, now);
        assert_eq!(task.version, 3);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        task.advance(TaskStatus::Completed, now);
        assert!(task.completed_at.is_some());
        assert!(task.actual_duration.is_some());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn input_helpers() {
        let mut input = TaskInput::new();
        input.insert("files", serde_json::json!(["main.go", "util.go"]));
        input.insert("capabilities", serde_json::json!(["shell"]));
        assert_eq!(input.files(), vec!["main.go", "util.go"]);
        assert_eq!(input.capability_tags(), vec!["shell".to_string()]);
        assert!(input.resume_snapshot().is_none());

        input.set_resume_snapshot(serde_json::json!({"step": 3}));
        assert_eq!(
            input.resume_snapshot().unwrap()["step"],
            serde_json::json!(3)
        );
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::Checkpointed).unwrap();
        assert_eq!(json, "\"checkpointed\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Checkpointed);
    }
}
