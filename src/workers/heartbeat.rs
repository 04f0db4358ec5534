//! Heartbeat monitor — liveness sweep and crash recovery trigger.
//!
//! Runs every heartbeat interval. A worker silent for the liveness window
//! (2× the interval by default) cannot be trusted to still be making
//! progress: it is marked Offline and every task it owns is routed through
//! the recovery path immediately, as a failed attempt rather than a silent
//! loss.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::task::events::TaskEvent;
use crate::task::manager::TaskManager;
use crate::workers::model::WorkerStatus;
use crate::workers::registry::WorkerRegistry;

/// Spawn the liveness monitor loop.
///
/// The first tick fires immediately, so orphaned assignments from a previous
/// orchestrator run are recovered at startup.
pub fn spawn_heartbeat_monitor(
    registry: Arc<WorkerRegistry>,
    checkpoints: Arc<CheckpointManager>,
    tasks: Arc<TaskManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = registry.config().heartbeat_interval;
        info!(interval_secs = interval.as_secs(), "Heartbeat monitor started");

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            run_liveness_cycle(&registry, &checkpoints, &tasks).await;
        }
    })
}

/// Single liveness cycle: find stale workers, mark them Offline, recover
/// their tasks. Public so tests and replicas can drive it directly.
pub async fn run_liveness_cycle(
    registry: &WorkerRegistry,
    checkpoints: &CheckpointManager,
    tasks: &TaskManager,
) {
    let workers = match registry.list().await {
        Ok(workers) => workers,
        Err(e) => {
            warn!(error = %e, "Failed to list workers for liveness sweep");
            return;
        }
    };

    let now = Utc::now();
    let window = registry.config().liveness_window();
    let stale: Vec<_> = workers
        .into_iter()
        .filter(|w| w.status != WorkerStatus::Offline && !w.heartbeat_current(now, window))
        .collect();

    if stale.is_empty() {
        return;
    }

    let recoveries = stale.iter().map(|worker| async {
        match registry.mark_offline(worker.id).await {
            Ok(true) => {
                warn!(
                    worker_id = %worker.id,
                    name = %worker.name,
                    last_heartbeat = %worker.last_heartbeat,
                    "Worker missed liveness window, marking offline"
                );
                tasks.emit(TaskEvent::WorkerOffline {
                    worker_id: worker.id,
                });
                if let Err(e) = checkpoints.recover_worker_tasks(worker.id).await {
                    warn!(worker_id = %worker.id, error = %e, "Recovery sweep failed");
                }
            }
            // Another monitor replica won; it runs the recovery.
            Ok(false) => {}
            Err(e) => {
                warn!(worker_id = %worker.id, error = %e, "Failed to mark worker offline");
            }
        }
    });
    join_all(recoveries).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, StateCache};
    use crate::config::OrchestratorConfig;
    use crate::store::{MemoryStore, StateStore};
    use crate::task::events::event_bus;
    use crate::task::manager::TransitionPayload;
    use crate::task::model::{TaskDraft, TaskStatus, TaskType};
    use crate::workers::model::WorkerRegistration;

    #[tokio::test]
    async fn silent_worker_goes_offline_and_tasks_requeue() {
        let store = Arc::new(MemoryStore::new());
        let config = OrchestratorConfig::default();
        let cache = StateCache::new(Arc::new(MemoryCache::new()), &config);
        let tasks = Arc::new(TaskManager::new(
            store.clone() as Arc<dyn StateStore>,
            cache,
            event_bus(),
            config.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            store.clone() as Arc<dyn StateStore>,
            config.clone(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone() as Arc<dyn StateStore>,
            tasks.clone(),
        ));

        let worker = registry
            .register(WorkerRegistration::new("w", ["testing"], 1))
            .await
            .unwrap();
        let task = tasks
            .submit(TaskDraft::new("t", TaskType::Testing, "planner"))
            .await
            .unwrap();
        let assigned = tasks
            .transition(
                task.id,
                task.version,
                TaskStatus::Assigned,
                TransitionPayload {
                    worker: Some(worker.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tasks.mark_started(assigned.id, worker.id).await.unwrap();

        // Age the heartbeat past the liveness window.
        let mut stale = store.get_worker(worker.id).await.unwrap().unwrap();
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(300);
        let expected = stale.version;
        stale.version += 1;
        store.update_worker(&stale, expected).await.unwrap();

        run_liveness_cycle(&registry, &checkpoints, &tasks).await;

        let worker_row = store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(worker_row.status, WorkerStatus::Offline);

        let task = tasks.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt, 1);
    }

    #[tokio::test]
    async fn live_workers_untouched() {
        let store = Arc::new(MemoryStore::new());
        let config = OrchestratorConfig::default();
        let cache = StateCache::new(Arc::new(MemoryCache::new()), &config);
        let tasks = Arc::new(TaskManager::new(
            store.clone() as Arc<dyn StateStore>,
            cache,
            event_bus(),
            config.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            store.clone() as Arc<dyn StateStore>,
            config,
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone() as Arc<dyn StateStore>,
            tasks.clone(),
        ));

        let worker = registry
            .register(WorkerRegistration::new("w", ["testing"], 1))
            .await
            .unwrap();

        run_liveness_cycle(&registry, &checkpoints, &tasks).await;
        let row = store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(row.status, WorkerStatus::Idle);
    }
}
