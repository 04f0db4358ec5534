//! Cache layer — read-through cache of task and worker-task-list state.
//!
//! Strictly subordinate to the durable store: every state-mutating operation
//! invalidates the affected entries before the mutation returns, and any
//! backend failure downgrades the layer to a no-op (reads miss, writes are
//! dropped) with a warning. The orchestrator stays fully correct with the
//! cache unreachable, only slower.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::CacheError;
use crate::task::model::Task;

/// Get/set/delete-with-TTL backend boundary. Failures must surface as
/// `CacheError` so the layer can degrade instead of propagating.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process cache backend with lazy expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Cache of task rows and per-worker task lists, keyed for invalidation by
/// the transition commit path.
#[derive(Clone)]
pub struct StateCache {
    backend: Arc<dyn CacheBackend>,
    task_ttl: Duration,
    worker_tasks_ttl: Duration,
}

impl StateCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &OrchestratorConfig) -> Self {
        Self {
            backend,
            task_ttl: config.task_cache_ttl,
            worker_tasks_ttl: config.worker_tasks_cache_ttl,
        }
    }

    fn task_key(id: Uuid) -> String {
        format!("task:{id}")
    }

    fn worker_tasks_key(worker_id: Uuid) -> String {
        format!("worker_tasks:{worker_id}")
    }

    /// Cached task, or `None` on miss or backend degradation.
    pub async fn get_cached_task(&self, id: Uuid) -> Option<Task> {
        let value = match self.backend.get(&Self::task_key(id)).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Cache read degraded to miss");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Cache a task row.
    pub async fn cache_task(&self, task: &Task) {
        let value = match serde_json::to_value(task) {
            Ok(v) => v,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to encode task for cache");
                return;
            }
        };
        if let Err(e) = self
            .backend
            .set(&Self::task_key(task.id), value, self.task_ttl)
            .await
        {
            warn!(task_id = %task.id, error = %e, "Cache write dropped");
        }
    }

    /// Drop a task's cache entry.
    pub async fn invalidate_task(&self, id: Uuid) {
        if let Err(e) = self.backend.delete(&Self::task_key(id)).await {
            warn!(task_id = %id, error = %e, "Cache invalidation dropped; TTL bounds staleness");
        }
    }

    /// Cached task list for a worker, or `None` on miss or degradation.
    pub async fn get_cached_worker_tasks(&self, worker_id: Uuid) -> Option<Vec<Task>> {
        let value = match self.backend.get(&Self::worker_tasks_key(worker_id)).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Cache read degraded to miss");
                return None;
            }
        };
        serde_json::from_value(value).ok()
    }

    /// Cache a worker's task list.
    pub async fn cache_worker_tasks(&self, worker_id: Uuid, tasks: &[Task]) {
        let value = match serde_json::to_value(tasks) {
            Ok(v) => v,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to encode task list for cache");
                return;
            }
        };
        if let Err(e) = self
            .backend
            .set(&Self::worker_tasks_key(worker_id), value, self.worker_tasks_ttl)
            .await
        {
            warn!(worker_id = %worker_id, error = %e, "Cache write dropped");
        }
    }

    /// Drop a worker's task-list entry.
    pub async fn invalidate_worker_tasks(&self, worker_id: Uuid) {
        if let Err(e) = self.backend.delete(&Self::worker_tasks_key(worker_id)).await {
            warn!(worker_id = %worker_id, error = %e, "Cache invalidation dropped");
        }
    }
}
