//! Scheduler — matches Ready tasks to eligible workers.
//!
//! Each pass orders the Ready set by priority (FIFO within a band), scores
//! candidate workers, and performs the `Ready → Assigned` transition through
//! the optimistic-concurrency contract. Replicas may run concurrently: a lost
//! race is a skip, never a double assignment. The same pass enforces run
//! deadlines and cancellation grace periods, so a hung task feeds the
//! retry/cascade logic instead of hanging silently.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Error, TaskError};
use crate::store::StateStore;
use crate::task::manager::{TaskManager, TransitionPayload};
use crate::task::model::{FailureReason, Task, TaskStatus, TaskType};
use crate::workers::model::Worker;
use crate::workers::registry::required_capabilities;

/// Outcome counters for one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Tasks assigned this pass.
    pub assigned: usize,
    /// Assignment races lost to another replica.
    pub lost_races: usize,
    /// Ready tasks with no eligible worker (they stay Ready).
    pub unmatched: usize,
    /// Running tasks failed for exceeding their run deadline.
    pub timed_out: usize,
    /// Cooperative cancellations forced after the grace period.
    pub force_cancelled: usize,
}

/// Matches Ready tasks to capable, available workers.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    tasks: Arc<TaskManager>,
    config: OrchestratorConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        tasks: Arc<TaskManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            config,
        }
    }

    /// One full pass: deadline sweep, then assignment sweep.
    pub async fn pass(&self) -> PassReport {
        let mut report = PassReport::default();
        self.enforce_deadlines(&mut report).await;
        self.assign_ready(&mut report).await;
        if report != PassReport::default() {
            debug!(?report, "Scheduler pass finished");
        }
        report
    }

    async fn assign_ready(&self, report: &mut PassReport) {
        let mut ready = match self.store.list_tasks_by_status(TaskStatus::Ready).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list ready tasks");
                return;
            }
        };
        if ready.is_empty() {
            return;
        }
        // Priority bands first, FIFO inside a band.
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut workers = match self.store.list_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!(error = %e, "Failed to list workers");
                return;
            }
        };

        for task in ready.into_iter().take(self.config.max_assignments_per_pass) {
            let required = required_capabilities(&task);
            let now = Utc::now();
            let window = self.config.liveness_window();

            let best = workers
                .iter_mut()
                .filter(|w| {
                    w.is_eligible(now, window) && required.is_subset(&w.capabilities)
                })
                .max_by(|a, b| {
                    score_worker(a, &required, task.task_type)
                        .partial_cmp(&score_worker(b, &required, task.task_type))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        // Stable tie-break so concurrent replicas mostly agree
                        // and the loser fails fast on the version check.
                        .then_with(|| b.id.cmp(&a.id))
                });
            let Some(best) = best else {
                debug!(
                    task_id = %task.id,
                    required = ?required,
                    "No eligible worker; task stays ready"
                );
                report.unmatched += 1;
                continue;
            };

            match self
                .tasks
                .transition(
                    task.id,
                    task.version,
                    TaskStatus::Assigned,
                    TransitionPayload {
                        worker: Some(best.id),
                        reason: Some(format!("assigned to {}", best.name)),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => {
                    info!(task_id = %task.id, worker_id = %best.id, "Task assigned");
                    // Keep the local snapshot honest for the rest of the pass.
                    best.take_assignment();
                    report.assigned += 1;
                }
                Err(Error::Task(TaskError::VersionConflict { .. })) => {
                    debug!(task_id = %task.id, "Lost assignment race, retrying next pass");
                    report.lost_races += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Assignment failed");
                }
            }
        }
    }

    /// Fail running tasks past their run deadline and force-cancel
    /// cooperative cancellations past the grace period.
    async fn enforce_deadlines(&self, report: &mut PassReport) {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.cancel_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for status in [TaskStatus::Running, TaskStatus::Checkpointed] {
            let running = match self.store.list_tasks_by_status(status).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "Failed to list running tasks");
                    return;
                }
            };

            for task in running {
                if let Some(requested) = task.cancel_requested_at {
                    if requested + grace < now {
                        warn!(task_id = %task.id, "Cancellation grace period expired, forcing");
                        if self.tasks.force_cancel(task.id).await.is_ok() {
                            report.force_cancelled += 1;
                        }
                        continue;
                    }
                }
                if task.overran_deadline(now) {
                    warn!(
                        task_id = %task.id,
                        max_run = ?task.max_run_duration,
                        "Task exceeded its run deadline"
                    );
                    let resume = self.resume_snapshot_for(&task).await;
                    match self
                        .tasks
                        .fail(
                            task.id,
                            FailureReason::Timeout,
                            "max run duration exceeded",
                            resume,
                        )
                        .await
                    {
                        Ok(_) => report.timed_out += 1,
                        Err(Error::Task(TaskError::VersionConflict { .. })) => {}
                        Err(e) => {
                            warn!(task_id = %task.id, error = %e, "Timeout handling failed");
                        }
                    }
                }
            }
        }
    }

    async fn resume_snapshot_for(&self, task: &Task) -> Option<serde_json::Value> {
        self.store
            .latest_checkpoint(task.id)
            .await
            .ok()
            .flatten()
            .filter(|cp| cp.attempt == task.attempt)
            .map(|cp| cp.snapshot)
    }
}

/// Score an eligible worker for a task: capability-match tightness (fewer
/// superfluous capabilities preferred), load headroom, and historical success
/// rate for the task type, equally weighted.
fn score_worker(worker: &Worker, required: &HashSet<String>, task_type: TaskType) -> f64 {
    let superfluous = worker.capabilities.len().saturating_sub(required.len()) as f64;
    let tightness = 1.0 / (1.0 + superfluous);
    let headroom = 1.0 - worker.current_load as f64 / worker.capacity as f64;
    let history = worker.success_rate(task_type);
    tightness + headroom + history
}

/// Spawn the assignment loop. The first tick fires immediately.
pub fn spawn_assignment_loop(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = scheduler.config.scheduler_interval;
        info!(interval_ms = interval.as_millis() as u64, "Assignment loop started");

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            scheduler.pass().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::{MemoryCache, StateCache};
    use crate::store::MemoryStore;
    use crate::task::events::event_bus;
    use crate::task::model::{TaskDraft, TaskPriority};
    use crate::workers::model::WorkerRegistration;

    struct Fixture {
        store: Arc<MemoryStore>,
        tasks: Arc<TaskManager>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = OrchestratorConfig::default();
        let cache = StateCache::new(Arc::new(MemoryCache::new()), &config);
        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            cache,
            event_bus(),
            config.clone(),
        ));
        let scheduler = Scheduler::new(store.clone(), tasks.clone(), config);
        Fixture {
            store,
            tasks,
            scheduler,
        }
    }

    async fn add_worker(fx: &Fixture, name: &str, caps: &[&str], capacity: u32) -> Worker {
        let worker = Worker::from_registration(WorkerRegistration::new(
            name,
            caps.iter().copied(),
            capacity,
        ))
        .unwrap();
        fx.store.insert_worker(&worker).await.unwrap();
        worker
    }

    #[tokio::test]
    async fn assigns_ready_task_to_capable_worker() {
        let fx = fixture();
        let worker = add_worker(&fx, "w", &["testing"], 1).await;
        let task = fx
            .tasks
            .submit(TaskDraft::new("t", TaskType::Testing, "planner"))
            .await
            .unwrap();

        let report = fx.scheduler.pass().await;
        assert_eq!(report.assigned, 1);

        let task = fx.tasks.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_worker, Some(worker.id));
        assert_eq!(
            fx.store
                .get_worker(worker.id)
                .await
                .unwrap()
                .unwrap()
                .current_load,
            1
        );
    }

    #[tokio::test]
    async fn unmatched_task_stays_ready() {
        let fx = fixture();
        add_worker(&fx, "w", &["documentation"], 1).await;
        let task = fx
            .tasks
            .submit(TaskDraft::new("t", TaskType::Testing, "planner"))
            .await
            .unwrap();

        let report = fx.scheduler.pass().await;
        assert_eq!(report.assigned, 0);
        assert_eq!(report.unmatched, 1);
        assert_eq!(
            fx.tasks.get_task(task.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn tighter_capability_match_wins() {
        let fx = fixture();
        let specialist = add_worker(&fx, "specialist", &["testing"], 4).await;
        add_worker(
            &fx,
            "generalist",
            &["testing", "debugging", "review", "research"],
            4,
        )
        .await;

        let task = fx
            .tasks
            .submit(TaskDraft::new("t", TaskType::Testing, "planner"))
            .await
            .unwrap();
        fx.scheduler.pass().await;

        let task = fx.tasks.get_task(task.id).await.unwrap();
        assert_eq!(task.assigned_worker, Some(specialist.id));
    }

    #[tokio::test]
    async fn least_loaded_wins_between_equals() {
        let fx = fixture();
        let idle = add_worker(&fx, "idle", &["testing"], 2).await;
        let busy = add_worker(&fx, "busy", &["testing"], 2).await;
        let mut busy_row = fx.store.get_worker(busy.id).await.unwrap().unwrap();
        busy_row.take_assignment();
        busy_row.version += 1;
        fx.store.update_worker(&busy_row, 0).await.unwrap();

        let task = fx
            .tasks
            .submit(TaskDraft::new("t", TaskType::Testing, "planner"))
            .await
            .unwrap();
        fx.scheduler.pass().await;

        let task = fx.tasks.get_task(task.id).await.unwrap();
        assert_eq!(task.assigned_worker, Some(idle.id));
    }

    #[tokio::test]
    async fn priority_bands_drain_first() {
        let fx = fixture();
        add_worker(&fx, "w", &["testing"], 1).await;

        let mut low = TaskDraft::new("low", TaskType::Testing, "planner");
        low.priority = TaskPriority::Low;
        let low = fx.tasks.submit(low).await.unwrap();

        let mut critical = TaskDraft::new("critical", TaskType::Testing, "planner");
        critical.priority = TaskPriority::Critical;
        let critical = fx.tasks.submit(critical).await.unwrap();

        let report = fx.scheduler.pass().await;
        // One slot: the critical task takes it.
        assert_eq!(report.assigned, 1);
        assert_eq!(
            fx.tasks.get_task(critical.id).await.unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(
            fx.tasks.get_task(low.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn deadline_overrun_feeds_retry_path() {
        let fx = fixture();
        let worker = add_worker(&fx, "w", &["testing"], 1).await;

        let mut draft = TaskDraft::new("slow", TaskType::Testing, "planner");
        draft.max_run_duration = Some(Duration::from_secs(60));
        let task = fx.tasks.submit(draft).await.unwrap();

        fx.scheduler.pass().await;
        fx.tasks.mark_started(task.id, worker.id).await.unwrap();

        // Backdate the start past the deadline.
        fx.tasks
            .mutate_fields(task.id, |t| {
                t.started_at = Some(Utc::now() - chrono::Duration::seconds(600));
            })
            .await
            .unwrap();

        let report = fx.scheduler.pass().await;
        assert_eq!(report.timed_out, 1);
        // One retry remained, so the same pass re-assigned the retry.
        assert_eq!(report.assigned, 1);

        let task = fx.tasks.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.attempt, 1);
    }

    #[tokio::test]
    async fn expired_grace_period_forces_cancellation() {
        let fx = fixture();
        let worker = add_worker(&fx, "w", &["testing"], 1).await;
        let task = fx
            .tasks
            .submit(TaskDraft::new("t", TaskType::Testing, "planner"))
            .await
            .unwrap();
        fx.scheduler.pass().await;
        fx.tasks.mark_started(task.id, worker.id).await.unwrap();

        fx.tasks.cancel(task.id).await.unwrap();
        // Still running cooperatively.
        assert_eq!(
            fx.tasks.get_task(task.id).await.unwrap().status,
            TaskStatus::Running
        );

        // Backdate the request past the grace period.
        fx.tasks
            .mutate_fields(task.id, |t| {
                t.cancel_requested_at = Some(Utc::now() - chrono::Duration::seconds(600));
            })
            .await
            .unwrap();

        let report = fx.scheduler.pass().await;
        assert_eq!(report.force_cancelled, 1);
        let task = fx.tasks.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(
            fx.store
                .get_worker(worker.id)
                .await
                .unwrap()
                .unwrap()
                .current_load,
            0
        );
    }
}
