//! Orchestrator — explicitly constructed context wiring every component.
//!
//! No global singletons: each `Orchestrator` owns its store handle, cache,
//! managers, and loops, so tests and multi-tenant deployments can run
//! independent instances side by side. This is the surface the (external)
//! transport layer calls.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{CacheBackend, StateCache};
use crate::checkpoint::{Checkpoint, CheckpointManager, TaskProgress};
use crate::config::OrchestratorConfig;
use crate::decompose::{DecompositionEngine, SplitAnalysis, SubtaskDescriptor};
use crate::error::Result;
use crate::scheduler::{Scheduler, spawn_assignment_loop};
use crate::store::StateStore;
use crate::task::events::{TaskEvent, event_bus};
use crate::task::manager::TaskManager;
use crate::task::model::{FailureReason, Task, TaskDraft, TaskResult};
use crate::workers::heartbeat::spawn_heartbeat_monitor;
use crate::workers::model::{Worker, WorkerRegistration};
use crate::workers::registry::WorkerRegistry;

/// The task orchestration engine.
pub struct Orchestrator {
    config: OrchestratorConfig,
    tasks: Arc<TaskManager>,
    registry: Arc<WorkerRegistry>,
    decomposer: DecompositionEngine,
    checkpoints: Arc<CheckpointManager>,
    scheduler: Arc<Scheduler>,
    events: broadcast::Sender<TaskEvent>,
}

impl Orchestrator {
    /// Wire an orchestrator over a store and cache backend.
    pub fn new(
        store: Arc<dyn StateStore>,
        cache_backend: Arc<dyn CacheBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        let events = event_bus();
        let cache = StateCache::new(cache_backend, &config);
        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            cache,
            events.clone(),
            config.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(store.clone(), config.clone()));
        let decomposer = DecompositionEngine::new(store.clone(), tasks.clone(), config.clone());
        let checkpoints = Arc::new(CheckpointManager::new(store.clone(), tasks.clone()));
        let scheduler = Arc::new(Scheduler::new(store, tasks.clone(), config.clone()));

        Self {
            config,
            tasks,
            registry,
            decomposer,
            checkpoints,
            scheduler,
            events,
        }
    }

    /// Spawn the background loops: assignment and liveness monitoring.
    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_assignment_loop(self.scheduler.clone()),
            spawn_heartbeat_monitor(
                self.registry.clone(),
                self.checkpoints.clone(),
                self.tasks.clone(),
            ),
        ]
    }

    // ── Task submission & queries ───────────────────────────────────

    /// Submit a task. Dependency-free tasks are immediately Ready.
    pub async fn submit_task(&self, draft: TaskDraft) -> Result<Uuid> {
        Ok(self.tasks.submit(draft).await?.id)
    }

    /// Expand a task into a validated subtask DAG.
    pub async fn decompose_task(
        &self,
        task_id: Uuid,
        descriptors: Vec<SubtaskDescriptor>,
    ) -> Result<Vec<Uuid>> {
        self.decomposer.decompose(task_id, descriptors).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.tasks.get_task(task_id).await
    }

    /// Tasks currently assigned to a worker (a worker process polls this to
    /// discover new assignments).
    pub async fn get_worker_tasks(&self, worker_id: Uuid) -> Result<Vec<Task>> {
        self.tasks.worker_tasks(worker_id).await
    }

    /// Latest checkpoint snapshot plus elapsed time.
    pub async fn get_task_progress(&self, task_id: Uuid) -> Result<TaskProgress> {
        self.checkpoints.task_progress(task_id).await
    }

    /// Cancel a task and all of its non-terminal descendants.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        self.tasks.cancel(task_id).await
    }

    /// Advisory complexity analysis for a persisted task.
    pub async fn analyze_task_for_splitting(&self, task_id: Uuid) -> Result<SplitAnalysis> {
        let task = self.tasks.get_task(task_id).await?;
        Ok(self.decomposer.analyze_for_splitting(&task))
    }

    // ── Worker surface ──────────────────────────────────────────────

    /// Register an execution endpoint.
    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<Uuid> {
        Ok(self.registry.register(registration).await?.id)
    }

    /// Record a worker heartbeat.
    pub async fn heartbeat(&self, worker_id: Uuid) -> Result<()> {
        self.registry.heartbeat(worker_id).await?;
        Ok(())
    }

    /// Stop routing new work to a worker; its running tasks finish.
    pub async fn set_draining(&self, worker_id: Uuid) -> Result<Worker> {
        self.registry.set_draining(worker_id).await
    }

    /// Worker acknowledges start of its assigned task.
    pub async fn mark_started(&self, task_id: Uuid, worker_id: Uuid) -> Result<Task> {
        self.tasks.mark_started(task_id, worker_id).await
    }

    /// Worker reports resumable progress.
    pub async fn report_progress(&self, task_id: Uuid, snapshot: Value) -> Result<Checkpoint> {
        self.checkpoints.create_checkpoint(task_id, snapshot).await
    }

    /// Worker reports the final outcome. Failure feeds the retry/cascade
    /// logic.
    pub async fn report_result(&self, task_id: Uuid, result: TaskResult) -> Result<Task> {
        if result.success {
            self.tasks.complete(task_id, result).await
        } else {
            let detail = result
                .error
                .clone()
                .unwrap_or_else(|| "worker reported failure".to_string());
            self.tasks
                .fail(task_id, FailureReason::ExecutionError, detail, None)
                .await
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Subscribe to orchestration events.
    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Drive one scheduler pass directly (tests, reactive deployments).
    pub async fn run_scheduler_pass(&self) -> crate::scheduler::PassReport {
        self.scheduler.pass().await
    }

    /// Drive one liveness sweep directly.
    pub async fn run_liveness_cycle(&self) {
        crate::workers::heartbeat::run_liveness_cycle(
            &self.registry,
            &self.checkpoints,
            &self.tasks,
        )
        .await;
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
