//! Configuration types.

use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// A worker silent for `liveness_factor × heartbeat_interval` is Offline.
    pub liveness_factor: u32,
    /// Interval between scheduler assignment passes.
    pub scheduler_interval: Duration,
    /// Maximum assignments performed in a single scheduler pass.
    pub max_assignments_per_pass: usize,
    /// Grace period a cooperatively cancelled task gets before force-cancel.
    pub cancel_grace: Duration,
    /// TTL for cached task entries.
    pub task_cache_ttl: Duration,
    /// TTL for cached per-worker task lists.
    pub worker_tasks_cache_ttl: Duration,
    /// Multiplier applied to summed subtask estimates (coordination overhead).
    /// Calibration is empirical — tune per deployment.
    pub coordination_overhead: f64,
    /// Complexity score above which a task is a decomposition candidate.
    pub split_threshold: f64,
    /// Split score weight per KiB of input payload.
    pub split_payload_weight: f64,
    /// Split score weight per required capability.
    pub split_capability_weight: f64,
    /// Split score weight per 100 characters of requirement text.
    pub split_text_weight: f64,
    /// Checkpoints kept per task after it reaches a terminal state.
    pub checkpoint_keep: usize,
    /// Default retry budget for tasks that don't declare one.
    pub default_max_retries: u32,
}

impl OrchestratorConfig {
    /// Window within which a worker's heartbeat counts as live.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.liveness_factor
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            liveness_factor: 2,
            scheduler_interval: Duration::from_secs(2),
            max_assignments_per_pass: 32,
            cancel_grace: Duration::from_secs(30),
            task_cache_ttl: Duration::from_secs(30),
            worker_tasks_cache_ttl: Duration::from_secs(15),
            coordination_overhead: 1.2,
            split_threshold: 10.0,
            split_payload_weight: 1.0,
            split_capability_weight: 2.0,
            split_text_weight: 0.5,
            checkpoint_keep: 5,
            default_max_retries: 1,
        }
    }
}
