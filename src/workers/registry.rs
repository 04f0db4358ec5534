//! Worker registry — liveness, capability matching, eligibility.
//!
//! Worker rows live in the store, not process memory, so multiple
//! orchestrator replicas see the same registry. All updates go through
//! conditional writes; heartbeat races with assignment commits simply retry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result, StoreError, WorkerError};
use crate::store::StateStore;
use crate::task::model::Task;
use crate::workers::model::{Worker, WorkerRegistration, WorkerStatus};

/// Attempts for heartbeat/status updates racing assignment commits.
const UPDATE_RETRIES: u32 = 3;

/// Toolchain capabilities implied by a file extension, mirroring how
/// diagnostic tooling is looked up per extension.
fn extension_capabilities(path: &str) -> &'static [&'static str] {
    let extension = path.rsplit('.').next().unwrap_or_default();
    match extension {
        "go" => &["go_build", "go_test"],
        "rs" => &["cargo_build", "cargo_test"],
        "py" => &["pytest"],
        "ts" | "tsx" | "js" | "jsx" => &["node_test"],
        _ => &[],
    }
}

/// The full capability set a task requires: its type's base capability, tags
/// declared at creation, explicit tags in the input payload, and toolchain
/// tags implied by the files it touches.
pub fn required_capabilities(task: &Task) -> HashSet<String> {
    let mut caps: HashSet<String> = task.required_capabilities.clone();
    caps.insert(task.task_type.base_capability().to_string());
    caps.extend(task.input.capability_tags());
    for file in task.input.files() {
        caps.extend(
            extension_capabilities(file)
                .iter()
                .map(|c| c.to_string()),
        );
    }
    caps
}

/// Registry over the store's worker table.
pub struct WorkerRegistry {
    store: Arc<dyn StateStore>,
    config: OrchestratorConfig,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn StateStore>, config: OrchestratorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a new worker.
    pub async fn register(&self, registration: WorkerRegistration) -> Result<Worker> {
        let worker = Worker::from_registration(registration).map_err(Error::Validation)?;
        self.store.insert_worker(&worker).await?;
        info!(
            worker_id = %worker.id,
            name = %worker.name,
            capacity = worker.capacity,
            "Worker registered"
        );
        Ok(worker)
    }

    pub async fn get(&self, id: Uuid) -> Result<Worker> {
        self.store
            .get_worker(id)
            .await?
            .ok_or_else(|| WorkerError::NotFound { id }.into())
    }

    pub async fn list(&self) -> Result<Vec<Worker>> {
        Ok(self.store.list_workers().await?)
    }

    /// Record a heartbeat. An Offline worker that reports back is revived —
    /// its re-queued tasks are gone, but it can take new ones.
    pub async fn heartbeat(&self, id: Uuid) -> Result<Worker> {
        self.update(id, |worker| {
            worker.last_heartbeat = Utc::now();
            if worker.status == WorkerStatus::Offline {
                worker.status = if worker.current_load > 0 {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Idle
                };
            }
        })
        .await
    }

    /// Stop routing new assignments to a worker; running tasks finish.
    pub async fn set_draining(&self, id: Uuid) -> Result<Worker> {
        self.update(id, |worker| {
            worker.status = WorkerStatus::Draining;
        })
        .await
    }

    /// Mark a worker Offline. Returns `false` when it already was (another
    /// monitor replica got there first).
    pub async fn mark_offline(&self, id: Uuid) -> Result<bool> {
        let worker = self.get(id).await?;
        if worker.status == WorkerStatus::Offline {
            return Ok(false);
        }
        let mut updated = worker.clone();
        updated.status = WorkerStatus::Offline;
        updated.version += 1;
        match self.store.update_worker(&updated, worker.version).await {
            Ok(()) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True iff the worker can take this task right now: capability superset,
    /// spare capacity, live heartbeat.
    pub fn can_handle(&self, worker: &Worker, task: &Task) -> bool {
        let required = required_capabilities(task);
        worker.is_eligible(Utc::now(), self.config.liveness_window())
            && required.is_subset(&worker.capabilities)
    }

    /// Workers eligible for a task.
    pub async fn eligible_workers(&self, task: &Task) -> Result<Vec<Worker>> {
        let workers = self.store.list_workers().await?;
        let eligible: Vec<Worker> = workers
            .into_iter()
            .filter(|w| self.can_handle(w, task))
            .collect();
        if eligible.is_empty() {
            debug!(task_id = %task.id, "No eligible worker; task stays ready");
        }
        Ok(eligible)
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<Worker>
    where
        F: Fn(&mut Worker),
    {
        let mut last_err = None;
        for _ in 0..UPDATE_RETRIES {
            let worker = self.get(id).await?;
            let mut updated = worker.clone();
            f(&mut updated);
            updated.version += 1;
            match self.store.update_worker(&updated, worker.version).await {
                Ok(()) => return Ok(updated),
                Err(e @ StoreError::VersionConflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(Error::Store)
            .unwrap_or_else(|| WorkerError::NotFound { id }.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::model::{TaskDraft, TaskType};

    fn registry() -> (WorkerRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            WorkerRegistry::new(store.clone(), OrchestratorConfig::default()),
            store,
        )
    }

    fn task_of(task_type: TaskType) -> Task {
        Task::from_draft(TaskDraft::new("t", task_type, "planner")).unwrap()
    }

    #[test]
    fn capabilities_derived_from_type_tags_and_files() {
        let mut task = task_of(TaskType::Debugging);
        task.required_capabilities.insert("shell".to_string());
        task.input
            .insert("files", serde_json::json!(["cmd/server/main.go"]));
        task.input
            .insert("capabilities", serde_json::json!(["docker"]));

        let caps = required_capabilities(&task);
        for expected in ["debugging", "shell", "docker", "go_build", "go_test"] {
            assert!(caps.contains(expected), "missing {expected}");
        }
    }

    #[test]
    fn unknown_extension_adds_nothing() {
        let mut task = task_of(TaskType::Review);
        task.input.insert("files", serde_json::json!(["README.md"]));
        let caps = required_capabilities(&task);
        assert_eq!(caps.len(), 1);
        assert!(caps.contains("review"));
    }

    #[tokio::test]
    async fn heartbeat_revives_offline_worker() {
        let (registry, _) = registry();
        let worker = registry
            .register(WorkerRegistration::new("w", ["testing"], 1))
            .await
            .unwrap();

        assert!(registry.mark_offline(worker.id).await.unwrap());
        // Second replica loses the race.
        assert!(!registry.mark_offline(worker.id).await.unwrap());

        let revived = registry.heartbeat(worker.id).await.unwrap();
        assert_eq!(revived.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn eligibility_requires_capability_superset() {
        let (registry, _) = registry();
        registry
            .register(WorkerRegistration::new("narrow", ["testing"], 1))
            .await
            .unwrap();
        let broad = registry
            .register(WorkerRegistration::new(
                "broad",
                ["testing", "go_build", "go_test"],
                1,
            ))
            .await
            .unwrap();

        let mut task = task_of(TaskType::Testing);
        task.input.insert("files", serde_json::json!(["pkg/a.go"]));

        let eligible = registry.eligible_workers(&task).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, broad.id);
    }

    #[tokio::test]
    async fn draining_worker_not_eligible() {
        let (registry, _) = registry();
        let worker = registry
            .register(WorkerRegistration::new("w", ["testing"], 1))
            .await
            .unwrap();
        registry.set_draining(worker.id).await.unwrap();

        let task = task_of(TaskType::Testing);
        assert!(registry.eligible_workers(&task).await.unwrap().is_empty());
    }
}
