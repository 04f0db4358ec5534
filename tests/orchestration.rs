//! End-to-end orchestration scenarios over a fully wired engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use conductor::cache::{CacheBackend, MemoryCache, StateCache};
use conductor::config::OrchestratorConfig;
use conductor::decompose::SubtaskDescriptor;
use conductor::error::{CacheError, Error, TaskError};
use conductor::orchestrator::Orchestrator;
use conductor::store::{MemoryStore, StateStore};
use conductor::task::events::event_bus;
use conductor::task::manager::{TaskManager, TransitionPayload};
use conductor::task::model::{
    FailureReason, TaskDraft, TaskResult, TaskStatus, TaskType,
};
use conductor::workers::model::{WorkerRegistration, WorkerStatus};

fn wired() -> (Orchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        OrchestratorConfig::default(),
    );
    (orchestrator, store)
}

async fn backdate_heartbeat(store: &MemoryStore, worker_id: uuid::Uuid, secs: i64) {
    let mut worker = store.get_worker(worker_id).await.unwrap().unwrap();
    let expected = worker.version;
    worker.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(secs);
    worker.version += 1;
    store.update_worker(&worker, expected).await.unwrap();
}

/// The root scenario: submit a parent, decompose into A ← B (← C), drive A
/// to completion, lose B's worker mid-run, exhaust B's retries, and watch C
/// cancel with an upstream-failure reason.
#[tokio::test]
async fn decompose_execute_recover_and_cascade() {
    let (orchestrator, store) = wired();

    let worker = orchestrator
        .register_worker(WorkerRegistration::new(
            "builder",
            ["code_generation", "testing"],
            2,
        ))
        .await
        .unwrap();

    let mut parent = TaskDraft::new("Ship feature", TaskType::Planning, "planner-agent");
    parent.max_retries = 0;
    let parent_id = orchestrator.submit_task(parent).await.unwrap();

    let ids = orchestrator
        .decompose_task(
            parent_id,
            vec![
                SubtaskDescriptor::new("gen", "Generate module", TaskType::CodeGeneration)
                    .estimated_minutes(30),
                SubtaskDescriptor::new("test", "Test module", TaskType::Testing)
                    .depends_on(["gen"])
                    .estimated_minutes(10),
                SubtaskDescriptor::new("review", "Review results", TaskType::Testing)
                    .depends_on(["test"]),
            ],
        )
        .await
        .unwrap();
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    // A is ready, B and C wait on their dependencies.
    assert_eq!(
        orchestrator.get_task(a).await.unwrap().status,
        TaskStatus::Ready
    );
    assert_eq!(
        orchestrator.get_task(b).await.unwrap().status,
        TaskStatus::Pending
    );

    // Assign and complete A; B becomes ready.
    let report = orchestrator.run_scheduler_pass().await;
    assert_eq!(report.assigned, 1);
    let queue = orchestrator.get_worker_tasks(worker).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, a);
    orchestrator.mark_started(a, worker).await.unwrap();
    orchestrator
        .report_result(a, TaskResult::success(Default::default()))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.get_task(b).await.unwrap().status,
        TaskStatus::Ready
    );

    // Assign B, start it, then lose the worker mid-run.
    orchestrator.run_scheduler_pass().await;
    orchestrator.mark_started(b, worker).await.unwrap();
    orchestrator
        .report_progress(b, serde_json::json!({"cases_run": 12}))
        .await
        .unwrap();

    backdate_heartbeat(&store, worker, 600).await;
    orchestrator.run_liveness_cycle().await;

    // B burned an attempt and re-entered Ready with the snapshot attached.
    let b_task = orchestrator.get_task(b).await.unwrap();
    assert_eq!(b_task.status, TaskStatus::Ready);
    assert_eq!(b_task.attempt, 1);
    assert_eq!(
        b_task.input.resume_snapshot().unwrap()["cases_run"],
        serde_json::json!(12)
    );

    // Replaying recovery must be a no-op.
    orchestrator.run_liveness_cycle().await;
    assert_eq!(orchestrator.get_task(b).await.unwrap().attempt, 1);

    // The worker comes back, takes B again, and this time reports failure.
    // With max_retries = 1 exhausted, B fails terminally and C cancels.
    orchestrator.heartbeat(worker).await.unwrap();
    orchestrator.run_scheduler_pass().await;
    orchestrator.mark_started(b, worker).await.unwrap();
    orchestrator
        .report_result(b, TaskResult::failure(FailureReason::ExecutionError, "assertion failed"))
        .await
        .unwrap();

    let b_task = orchestrator.get_task(b).await.unwrap();
    assert_eq!(b_task.status, TaskStatus::Failed);

    let c_task = orchestrator.get_task(c).await.unwrap();
    assert_eq!(c_task.status, TaskStatus::Cancelled);
    assert_eq!(
        c_task.result.unwrap().failure,
        Some(FailureReason::UpstreamFailure)
    );
}

/// Concurrent assignment attempts on the same `(task, version)` yield exactly
/// one success and N−1 version conflicts.
#[tokio::test]
async fn racing_assignments_produce_one_winner() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let config = OrchestratorConfig::default();
    let cache = StateCache::new(Arc::new(MemoryCache::new()), &config);
    let manager = Arc::new(TaskManager::new(
        store.clone(),
        cache,
        event_bus(),
        config,
    ));

    let mut workers = Vec::new();
    for i in 0..4 {
        let worker = conductor::workers::model::Worker::from_registration(
            WorkerRegistration::new(format!("w{i}"), ["testing"], 1),
        )
        .unwrap();
        store.insert_worker(&worker).await.unwrap();
        workers.push(worker.id);
    }

    let task = manager
        .submit(TaskDraft::new("contended", TaskType::Testing, "planner"))
        .await
        .unwrap();

    let attempts = workers.into_iter().map(|worker_id| {
        let manager = manager.clone();
        let task_id = task.id;
        let expected = task.version;
        async move {
            manager
                .transition(
                    task_id,
                    expected,
                    TaskStatus::Assigned,
                    TransitionPayload {
                        worker: Some(worker_id),
                        ..Default::default()
                    },
                )
                .await
        }
    });
    let outcomes = join_all(attempts).await;

    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(Error::Task(TaskError::VersionConflict { .. }))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 3);

    let task = manager.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.version, 2);
}

/// Two scheduler replicas sweeping the same store never double-assign.
#[tokio::test]
async fn scheduler_replicas_share_a_store_safely() {
    let store = Arc::new(MemoryStore::new());
    // Replicas share the store and the cache service, as in production.
    let cache = Arc::new(MemoryCache::new());
    let config = OrchestratorConfig::default();
    let replica_a = Orchestrator::new(store.clone(), cache.clone(), config.clone());
    let replica_b = Orchestrator::new(store.clone(), cache, config);

    replica_a
        .register_worker(WorkerRegistration::new("w", ["testing"], 4))
        .await
        .unwrap();
    for i in 0..4 {
        replica_a
            .submit_task(TaskDraft::new(
                format!("task {i}"),
                TaskType::Testing,
                "planner",
            ))
            .await
            .unwrap();
    }

    let (report_a, report_b) =
        tokio::join!(replica_a.run_scheduler_pass(), replica_b.run_scheduler_pass());

    // Every task assigned exactly once across both replicas.
    assert_eq!(report_a.assigned + report_b.assigned, 4);
    let assigned = store
        .list_tasks_by_status(TaskStatus::Assigned)
        .await
        .unwrap();
    assert_eq!(assigned.len(), 4);
}

/// A cyclic descriptor batch persists zero rows.
#[tokio::test]
async fn cycle_rejection_leaves_no_rows() {
    let (orchestrator, store) = wired();
    let parent_id = orchestrator
        .submit_task(TaskDraft::new("root", TaskType::Planning, "planner"))
        .await
        .unwrap();

    let result = orchestrator
        .decompose_task(
            parent_id,
            vec![
                SubtaskDescriptor::new("a", "A", TaskType::Testing).depends_on(["c"]),
                SubtaskDescriptor::new("b", "B", TaskType::Testing).depends_on(["a"]),
                SubtaskDescriptor::new("c", "C", TaskType::Testing).depends_on(["b"]),
            ],
        )
        .await;
    assert!(result.is_err());
    assert!(store.list_children(parent_id).await.unwrap().is_empty());
}

/// A cache backend that fails every call.
struct UnreachableCache;

#[async_trait]
impl CacheBackend for UnreachableCache {
    async fn get(&self, _key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        Err(CacheError::Unavailable("refused".to_string()))
    }

    async fn set(
        &self,
        _key: &str,
        _value: serde_json::Value,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("refused".to_string()))
    }
}

/// The engine stays fully correct with the cache backend down.
#[tokio::test]
async fn unreachable_cache_degrades_without_breaking_anything() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(UnreachableCache),
        OrchestratorConfig::default(),
    );

    let worker = orchestrator
        .register_worker(WorkerRegistration::new("w", ["testing"], 1))
        .await
        .unwrap();
    let task_id = orchestrator
        .submit_task(TaskDraft::new("t", TaskType::Testing, "planner"))
        .await
        .unwrap();

    orchestrator.run_scheduler_pass().await;
    orchestrator.mark_started(task_id, worker).await.unwrap();
    orchestrator
        .report_result(task_id, TaskResult::success(Default::default()))
        .await
        .unwrap();

    let task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

/// After a mutation returns, a read sees the new state — never the old one.
#[tokio::test]
async fn reads_after_mutation_are_fresh() {
    let (orchestrator, _) = wired();
    let task_id = orchestrator
        .submit_task(TaskDraft::new("t", TaskType::Testing, "planner"))
        .await
        .unwrap();

    // Prime the cache, mutate, read again.
    assert_eq!(
        orchestrator.get_task(task_id).await.unwrap().status,
        TaskStatus::Ready
    );
    orchestrator.cancel_task(task_id).await.unwrap();
    assert_eq!(
        orchestrator.get_task(task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );
}

/// Draining stops new assignments; heartbeat loss flips a worker offline and
/// a later heartbeat revives it.
#[tokio::test]
async fn worker_lifecycle_draining_and_revival() {
    let (orchestrator, store) = wired();
    let worker = orchestrator
        .register_worker(WorkerRegistration::new("w", ["testing"], 1))
        .await
        .unwrap();

    orchestrator.set_draining(worker).await.unwrap();
    orchestrator
        .submit_task(TaskDraft::new("t", TaskType::Testing, "planner"))
        .await
        .unwrap();
    let report = orchestrator.run_scheduler_pass().await;
    assert_eq!(report.assigned, 0);
    assert_eq!(report.unmatched, 1);

    backdate_heartbeat(&store, worker, 600).await;
    orchestrator.run_liveness_cycle().await;
    assert_eq!(
        store.get_worker(worker).await.unwrap().unwrap().status,
        WorkerStatus::Offline
    );

    orchestrator.heartbeat(worker).await.unwrap();
    assert_eq!(
        store.get_worker(worker).await.unwrap().unwrap().status,
        WorkerStatus::Idle
    );
}

/// The event bus reports the transition history in order.
#[tokio::test]
async fn event_stream_tracks_transitions() {
    let (orchestrator, _) = wired();
    let mut events = BroadcastStream::new(orchestrator.events());

    let worker = orchestrator
        .register_worker(WorkerRegistration::new("w", ["testing"], 1))
        .await
        .unwrap();
    let task_id = orchestrator
        .submit_task(TaskDraft::new("t", TaskType::Testing, "planner"))
        .await
        .unwrap();
    orchestrator.run_scheduler_pass().await;
    orchestrator.mark_started(task_id, worker).await.unwrap();
    orchestrator
        .report_progress(task_id, serde_json::json!({"step": 1}))
        .await
        .unwrap();

    let mut statuses = Vec::new();
    let mut checkpoints = 0;
    while let Ok(Some(Ok(event))) =
        tokio::time::timeout(Duration::from_millis(50), events.next()).await
    {
        match event {
            conductor::task::TaskEvent::StatusChanged { to, .. } => statuses.push(to),
            conductor::task::TaskEvent::CheckpointRecorded { sequence, .. } => {
                assert_eq!(sequence, 1);
                checkpoints += 1;
            }
            _ => {}
        }
    }

    assert_eq!(
        statuses,
        vec![
            TaskStatus::Ready,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Checkpointed,
        ]
    );
    assert_eq!(checkpoints, 1);
}
