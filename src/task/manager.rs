//! Task manager — the single mutation gateway for task state.
//!
//! Every status change goes through [`TaskManager::transition`], which
//! enforces the state machine, commits through the store's conditional-update
//! primitives (the optimistic-concurrency contract), invalidates the affected
//! cache entries before returning, and emits a [`TaskEvent`].
//!
//! Worker load never moves on its own: transitions that bind or release a
//! worker commit the task row and the worker row together via
//! `update_task_and_worker`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::StateCache;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result, StoreError, TaskError, ValidationError};
use crate::store::StateStore;
use crate::task::events::TaskEvent;
use crate::task::model::{FailureReason, Task, TaskDraft, TaskResult, TaskStatus};
use crate::workers::model::Worker;

/// Attempts for internal field mutations that race other writers.
const MUTATE_RETRIES: u32 = 3;

/// Extra data carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPayload {
    /// Human-readable reason, recorded on the emitted event.
    pub reason: Option<String>,
    /// Worker to bind; required for transitions into `Assigned`.
    pub worker: Option<Uuid>,
    /// Outcome to record; used by terminal transitions.
    pub result: Option<TaskResult>,
    /// Checkpoint snapshot attached to `input` on the retry edge so the next
    /// assignment resumes instead of redoing finished sub-steps.
    pub resume_snapshot: Option<Value>,
}

impl TransitionPayload {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Single mutation gateway for tasks.
pub struct TaskManager {
    store: Arc<dyn StateStore>,
    cache: StateCache,
    events: broadcast::Sender<TaskEvent>,
    config: OrchestratorConfig,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: StateCache,
        events: broadcast::Sender<TaskEvent>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            config,
        }
    }

    /// Subscribe to the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        // No receivers is fine; events are best-effort notifications.
        let _ = self.events.send(event);
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Get a task, read-through the cache.
    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        if let Some(task) = self.cache.get_cached_task(id).await {
            return Ok(task);
        }
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })?;
        self.cache.cache_task(&task).await;
        Ok(task)
    }

    /// Tasks assigned to a worker, read-through the cache.
    pub async fn worker_tasks(&self, worker_id: Uuid) -> Result<Vec<Task>> {
        if let Some(tasks) = self.cache.get_cached_worker_tasks(worker_id).await {
            return Ok(tasks);
        }
        let tasks = self.store.list_worker_tasks(worker_id).await?;
        self.cache.cache_worker_tasks(worker_id, &tasks).await;
        Ok(tasks)
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Validate and persist a new task. Dependency-free tasks (or tasks whose
    /// dependencies are already complete) are promoted to Ready immediately.
    pub async fn submit(&self, draft: TaskDraft) -> Result<Task> {
        let task = Task::from_draft(draft).map_err(Error::Validation)?;

        // Dependencies must refer to known tasks. A fresh node can only add
        // outgoing edges, so it cannot close a cycle.
        for dep in &task.depends_on {
            if *dep == task.id {
                return Err(ValidationError::SelfDependency.into());
            }
            if self.store.get_task(*dep).await?.is_none() {
                return Err(ValidationError::UnknownDependency { id: *dep }.into());
            }
        }

        self.store.insert_task(&task).await?;
        info!(task_id = %task.id, task_type = %task.task_type, "Task submitted");

        if self.deps_satisfied(&task).await? {
            return self
                .transition(
                    task.id,
                    task.version,
                    TaskStatus::Ready,
                    TransitionPayload::with_reason("dependencies satisfied"),
                )
                .await;
        }
        Ok(task)
    }

    // ── The transition contract ─────────────────────────────────────

    /// Transition a task to a new status.
    ///
    /// Fails with [`TaskError::VersionConflict`] when `expected_version` does
    /// not match the stored row — no two callers can both win an assignment
    /// race. A successful call commits the new state, increments `version`,
    /// invalidates the affected cache entries, and emits a `TaskEvent`.
    pub async fn transition(
        &self,
        task_id: Uuid,
        expected_version: u64,
        new_status: TaskStatus,
        payload: TransitionPayload,
    ) -> Result<Task> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        if task.version != expected_version {
            return Err(TaskError::VersionConflict {
                id: task_id,
                expected: expected_version,
                actual: task.version,
            }
            .into());
        }
        let from = task.status;
        if !from.can_transition_to(new_status) {
            return Err(TaskError::InvalidTransition {
                id: task_id,
                from,
                to: new_status,
            }
            .into());
        }

        let previous_worker = task.assigned_worker;
        let now = Utc::now();

        match new_status {
            TaskStatus::Assigned => {
                let worker_id = payload
                    .worker
                    .ok_or(TaskError::MissingWorker { status: new_status })?;
                task.assigned_worker = Some(worker_id);
            }
            TaskStatus::Ready if from == TaskStatus::Failed => {
                // Retry edge: burn an attempt, carry forward any progress.
                // Run stamps reset so the next attempt gets a fresh deadline.
                task.attempt += 1;
                task.result = None;
                task.cancel_requested_at = None;
                task.started_at = None;
                task.completed_at = None;
                task.actual_duration = None;
                if let Some(snapshot) = payload.resume_snapshot.clone() {
                    task.input.set_resume_snapshot(snapshot);
                }
            }
            status if status.is_terminal() => {
                if payload.result.is_some() {
                    task.result = payload.result.clone();
                }
                task.assigned_worker = None;
            }
            _ => {}
        }
        task.advance(new_status, now);

        // A transition that binds or releases a worker moves the load counter
        // in the same store commit.
        let worker_update = self
            .worker_delta(&task, from, new_status, previous_worker, payload.worker)
            .await?;

        let commit = match &worker_update {
            Some((worker, expected)) => {
                self.store
                    .update_task_and_worker(&task, expected_version, worker, *expected)
                    .await
            }
            None => self.store.update_task(&task, expected_version).await,
        };
        commit.map_err(|e| match e {
            StoreError::VersionConflict {
                entity: "task",
                id,
                expected,
                actual,
            } => Error::Task(TaskError::VersionConflict {
                id,
                expected,
                actual,
            }),
            other => Error::Store(other),
        })?;

        // Invalidate before the caller sees success: a subsequent read must
        // observe the new state or a miss, never the pre-transition row.
        self.cache.invalidate_task(task.id).await;
        for worker_id in [previous_worker, task.assigned_worker]
            .into_iter()
            .flatten()
            .collect::<HashSet<_>>()
        {
            self.cache.invalidate_worker_tasks(worker_id).await;
        }

        debug!(task_id = %task.id, %from, to = %new_status, version = task.version, "Transition committed");
        self.emit(TaskEvent::StatusChanged {
            task_id: task.id,
            from,
            to: new_status,
            version: task.version,
            reason: payload.reason,
        });

        Ok(task)
    }

    /// Compute the worker row accompanying a transition commit, if any.
    async fn worker_delta(
        &self,
        task: &Task,
        from: TaskStatus,
        to: TaskStatus,
        previous_worker: Option<Uuid>,
        bound_worker: Option<Uuid>,
    ) -> Result<Option<(Worker, u64)>> {
        let binding = to == TaskStatus::Assigned;
        let releasing = matches!(
            from,
            TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Checkpointed
        ) && (to.is_terminal() || to == TaskStatus::Ready);

        let worker_id = if binding { bound_worker } else { previous_worker };
        if !(binding || releasing) {
            return Ok(None);
        }
        let Some(worker_id) = worker_id else {
            return Ok(None);
        };
        let Some(mut worker) = self.store.get_worker(worker_id).await? else {
            // Worker rows are not deleted while a task references them; a
            // missing row means the collaborator broke that contract.
            warn!(worker_id = %worker_id, task_id = %task.id, "Assigned worker row missing");
            return Ok(None);
        };

        let expected = worker.version;
        if binding {
            worker.take_assignment();
        } else {
            worker.release_assignment();
            match to {
                TaskStatus::Completed => worker.record_outcome(task.task_type, true),
                TaskStatus::Failed => worker.record_outcome(task.task_type, false),
                _ => {}
            }
        }
        worker.version += 1;
        Ok(Some((worker, expected)))
    }

    /// Promote a Pending task to Ready once its wait set is satisfied.
    /// Returns whether a promotion happened.
    pub async fn promote_if_ready(&self, task_id: Uuid) -> Result<bool> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;
        if task.status != TaskStatus::Pending || !self.deps_satisfied(&task).await? {
            return Ok(false);
        }
        match self
            .transition(
                task_id,
                task.version,
                TaskStatus::Ready,
                TransitionPayload::with_reason("dependencies satisfied"),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::Task(TaskError::VersionConflict { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Mutate non-status task fields under the same CAS discipline. Retries a
    /// handful of times on conflicts with other writers.
    pub(crate) async fn mutate_fields<F>(&self, task_id: Uuid, f: F) -> Result<Task>
    where
        F: Fn(&mut Task),
    {
        let mut last_err = None;
        for _ in 0..MUTATE_RETRIES {
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(TaskError::NotFound { id: task_id })?;
            let expected = task.version;
            f(&mut task);
            task.version += 1;
            task.updated_at = Utc::now();
            match self.store.update_task(&task, expected).await {
                Ok(()) => {
                    self.cache.invalidate_task(task_id).await;
                    return Ok(task);
                }
                Err(e @ StoreError::VersionConflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(Error::Store)
            .unwrap_or_else(|| TaskError::NotFound { id: task_id }.into()))
    }

    // ── Execution lifecycle ─────────────────────────────────────────

    /// Worker acknowledges start of an assigned task.
    pub async fn mark_started(&self, task_id: Uuid, worker_id: Uuid) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        if task.assigned_worker != Some(worker_id) {
            return Err(TaskError::NotAssignedToWorker {
                id: task_id,
                worker_id,
            }
            .into());
        }
        self.transition(
            task_id,
            task.version,
            TaskStatus::Running,
            TransitionPayload::with_reason("worker acknowledged start"),
        )
        .await
    }

    /// Record a successful result, then promote dependents whose wait sets
    /// are now satisfied.
    pub async fn complete(&self, task_id: Uuid, result: TaskResult) -> Result<Task> {
        let current = self.get_task(task_id).await?;
        let task = self
            .transition(
                task_id,
                current.version,
                TaskStatus::Completed,
                TransitionPayload {
                    result: Some(result),
                    reason: Some("worker reported success".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        self.promote_dependents(task_id).await?;
        self.prune_checkpoints(task_id).await;
        Ok(task)
    }

    /// Record a failed attempt.
    ///
    /// While the retry budget lasts, the task re-enters Ready with `attempt`
    /// incremented and any recovery snapshot attached to its input. Once
    /// exhausted the task is terminally Failed and the cascade cancels every
    /// transitive dependent that doesn't allow partial upstream.
    pub async fn fail(
        &self,
        task_id: Uuid,
        reason: FailureReason,
        detail: impl Into<String>,
        resume_snapshot: Option<Value>,
    ) -> Result<Task> {
        let current = self.get_task(task_id).await?;
        let detail = detail.into();
        let failed = self
            .transition(
                task_id,
                current.version,
                TaskStatus::Failed,
                TransitionPayload {
                    result: Some(TaskResult::failure(reason, detail.clone())),
                    reason: Some(detail),
                    ..Default::default()
                },
            )
            .await?;

        if failed.can_retry() {
            let requeued = self
                .transition(
                    task_id,
                    failed.version,
                    TaskStatus::Ready,
                    TransitionPayload {
                        reason: Some(format!(
                            "retry {} of {}",
                            failed.attempt + 1,
                            failed.max_retries
                        )),
                        resume_snapshot,
                        ..Default::default()
                    },
                )
                .await?;
            info!(task_id = %task_id, attempt = requeued.attempt, "Task re-queued for retry");
            return Ok(requeued);
        }

        warn!(task_id = %task_id, attempt = failed.attempt, ?reason, "Task failed terminally");
        self.prune_checkpoints(task_id).await;
        self.cascade_upstream_failure(task_id).await?;
        Ok(failed)
    }

    /// Promote Pending dependents of a completed task whose dependencies are
    /// now all satisfied.
    pub async fn promote_dependents(&self, completed_id: Uuid) -> Result<()> {
        for dependent in self.store.list_dependents(completed_id).await? {
            if dependent.status != TaskStatus::Pending {
                continue;
            }
            if !self.deps_satisfied(&dependent).await? {
                continue;
            }
            match self
                .transition(
                    dependent.id,
                    dependent.version,
                    TaskStatus::Ready,
                    TransitionPayload::with_reason("dependencies satisfied"),
                )
                .await
            {
                Ok(_) => {}
                // Another replica promoted it first; that's the point of OCC.
                Err(Error::Task(TaskError::VersionConflict { .. })) => {
                    debug!(task_id = %dependent.id, "Lost promotion race, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn deps_satisfied(&self, task: &Task) -> Result<bool> {
        for dep in &task.depends_on {
            let dep_task = self
                .store
                .get_task(*dep)
                .await?
                .ok_or(TaskError::NotFound { id: *dep })?;
            if dep_task.status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ── Cascading failure ───────────────────────────────────────────

    /// Cancel all direct and transitive dependents of a terminally failed
    /// task, except those that allow partial upstream — for them the failed
    /// dependency leaves the wait set instead.
    async fn cascade_upstream_failure(&self, failed_id: Uuid) -> Result<()> {
        let mut queue = VecDeque::from([failed_id]);
        let mut visited = HashSet::from([failed_id]);

        while let Some(id) = queue.pop_front() {
            for dependent in self.store.list_dependents(id).await? {
                if dependent.status.is_terminal() {
                    continue;
                }
                if dependent.allow_partial_upstream {
                    // Not marked visited: each lost upstream is excluded
                    // separately when several feed the same dependent.
                    let updated = self
                        .mutate_fields(dependent.id, |t| {
                            t.depends_on.remove(&id);
                        })
                        .await?;
                    info!(
                        task_id = %updated.id,
                        excluded = %id,
                        "Excluded failed dependency from wait set"
                    );
                    if updated.status == TaskStatus::Pending && self.deps_satisfied(&updated).await?
                    {
                        self.transition(
                            updated.id,
                            updated.version,
                            TaskStatus::Ready,
                            TransitionPayload::with_reason("partial upstream accepted"),
                        )
                        .await?;
                    }
                    continue;
                }

                if !visited.insert(dependent.id) {
                    continue;
                }
                self.cancel_subtree(dependent.id, FailureReason::UpstreamFailure)
                    .await?;
                queue.push_back(dependent.id);
            }
        }
        Ok(())
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Cancel a task and all of its non-terminal descendants. Running tasks
    /// are cancelled cooperatively: the worker is notified and gets a grace
    /// period before the deadline sweep force-cancels.
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        // Existence check up front so callers get NotFound, not silence.
        self.get_task(task_id).await?;
        self.cancel_subtree(task_id, FailureReason::Cancelled).await
    }

    async fn cancel_subtree(&self, root: Uuid, reason: FailureReason) -> Result<()> {
        // Children inherit cancellation from the parent, never the reverse.
        let mut queue = VecDeque::from([root]);
        let mut members = vec![root];
        let mut visited = HashSet::from([root]);
        while let Some(id) = queue.pop_front() {
            for child in self.store.list_children(id).await? {
                if visited.insert(child.id) {
                    members.push(child.id);
                    queue.push_back(child.id);
                }
            }
        }

        for id in members {
            let task = match self.store.get_task(id).await? {
                Some(t) => t,
                None => continue,
            };
            if task.status.is_terminal() {
                continue;
            }
            if task.status.is_running_like() {
                if task.cancel_requested_at.is_none() {
                    self.request_cancel(&task).await?;
                }
                continue;
            }
            match self
                .transition(
                    id,
                    task.version,
                    TaskStatus::Cancelled,
                    TransitionPayload {
                        result: Some(TaskResult::failure(reason, "cancelled")),
                        reason: Some(format!("{reason:?}")),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => {}
                Err(Error::Task(TaskError::VersionConflict { .. })) => {
                    debug!(task_id = %id, "Cancellation lost a race, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Ask a running task's worker to stop.
    async fn request_cancel(&self, task: &Task) -> Result<()> {
        let now = Utc::now();
        self.mutate_fields(task.id, move |t| {
            if t.cancel_requested_at.is_none() {
                t.cancel_requested_at = Some(now);
            }
        })
        .await?;
        let deadline = now
            + chrono::Duration::from_std(self.config.cancel_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        info!(task_id = %task.id, %deadline, "Requested cooperative cancellation");
        self.emit(TaskEvent::CancelRequested {
            task_id: task.id,
            deadline,
        });
        Ok(())
    }

    /// Force-cancel a running task whose cooperative grace period expired.
    /// Treated like a crashed worker: the slot is released in the same commit.
    pub async fn force_cancel(&self, task_id: Uuid) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if !task.status.is_running_like() {
            return Ok(());
        }
        match self
            .transition(
                task_id,
                task.version,
                TaskStatus::Cancelled,
                TransitionPayload {
                    result: Some(TaskResult::failure(
                        FailureReason::Cancelled,
                        "cancellation grace period expired",
                    )),
                    reason: Some("cancellation grace period expired".to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Task(TaskError::VersionConflict { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn prune_checkpoints(&self, task_id: Uuid) {
        match self
            .store
            .prune_checkpoints(task_id, self.config.checkpoint_keep)
            .await
        {
            Ok(0) => {}
            Ok(n) => debug!(task_id = %task_id, pruned = n, "Pruned checkpoints"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Checkpoint pruning failed"),
        }
    }
}
