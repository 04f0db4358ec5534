//! Decomposition engine — subtask descriptors into a validated DAG.
//!
//! A planning agent proposes subtasks as descriptors with label-addressed
//! dependencies. The engine normalizes them into draft tasks, resolves labels
//! to ids, rejects cycles, and persists the whole batch transactionally —
//! either every subtask lands or none do.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DecompositionError, Error, Result};
use crate::store::StateStore;
use crate::task::manager::TaskManager;
use crate::task::model::{Task, TaskDraft, TaskInput, TaskPriority, TaskType};

/// A candidate subtask proposed by the decomposition input provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDescriptor {
    /// Stable batch-local label, referenced by `depends_on_labels`.
    pub label: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub estimated_duration_minutes: Option<u64>,
    /// Labels of subtasks in this batch, or ids of pre-existing tasks.
    #[serde(default)]
    pub depends_on_labels: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub allow_partial_upstream: bool,
    #[serde(default)]
    pub input: TaskInput,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubtaskDescriptor {
    pub fn new(
        label: impl Into<String>,
        title: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            label: label.into(),
            title: title.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::default(),
            estimated_duration_minutes: None,
            depends_on_labels: Vec::new(),
            required_capabilities: Vec::new(),
            allow_partial_upstream: false,
            input: TaskInput::new(),
            max_retries: None,
        }
    }

    pub fn depends_on(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on_labels
            .extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn estimated_minutes(mut self, minutes: u64) -> Self {
        self.estimated_duration_minutes = Some(minutes);
        self
    }
}

/// Advisory verdict of the complexity heuristic.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SplitAnalysis {
    /// Weighted complexity score.
    pub score: f64,
    /// Threshold the score is compared against.
    pub threshold: f64,
    /// Whether this task is a decomposition candidate. Callers may force
    /// either way regardless.
    pub should_split: bool,
}

/// Turns one task plus descriptors into a validated subtask DAG.
pub struct DecompositionEngine {
    store: Arc<dyn StateStore>,
    tasks: Arc<TaskManager>,
    config: OrchestratorConfig,
    label_pattern: Regex,
}

impl DecompositionEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        tasks: Arc<TaskManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            config,
            label_pattern: Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap(),
        }
    }

    /// Decompose `parent_id` into the described subtasks.
    ///
    /// The batch is validated as a whole: duplicate or malformed labels,
    /// unresolvable dependencies, and dependency cycles each reject it
    /// atomically with nothing persisted. On success every subtask is
    /// persisted Pending with `parent_id` set, dependency-free subtasks are
    /// promoted to Ready, and the parent's estimate is refreshed from the
    /// subtask sum plus coordination overhead.
    pub async fn decompose(
        &self,
        parent_id: Uuid,
        descriptors: Vec<SubtaskDescriptor>,
    ) -> Result<Vec<Uuid>> {
        if descriptors.is_empty() {
            return Err(DecompositionError::EmptyBatch.into());
        }
        let parent = self
            .store
            .get_task(parent_id)
            .await?
            .ok_or(DecompositionError::ParentNotFound { id: parent_id })?;
        if parent.status.is_terminal() {
            return Err(DecompositionError::ParentTerminal {
                id: parent_id,
                status: parent.status,
            }
            .into());
        }

        // Normalize descriptors into drafts and build the label table.
        let mut by_label: HashMap<String, Uuid> = HashMap::new();
        let mut drafts: Vec<(SubtaskDescriptor, Task)> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if !self.label_pattern.is_match(&descriptor.label) {
                return Err(DecompositionError::UnresolvedLabel {
                    label: descriptor.label,
                }
                .into());
            }
            let task = self.normalize(&parent, &descriptor)?;
            if by_label.insert(descriptor.label.clone(), task.id).is_some() {
                return Err(DecompositionError::DuplicateLabel {
                    label: descriptor.label,
                }
                .into());
            }
            drafts.push((descriptor, task));
        }

        // Resolve dependency labels: batch-local labels first, then ids of
        // pre-existing tasks. Anything else rejects the batch.
        let mut referenced_existing: HashMap<Uuid, Task> = HashMap::new();
        for (descriptor, task) in &mut drafts {
            for dep_label in &descriptor.depends_on_labels {
                let dep_id = match by_label.get(dep_label) {
                    Some(id) => *id,
                    None => {
                        let id = dep_label.parse::<Uuid>().map_err(|_| {
                            DecompositionError::UnresolvedLabel {
                                label: dep_label.clone(),
                            }
                        })?;
                        let existing = self.store.get_task(id).await?.ok_or_else(|| {
                            DecompositionError::UnresolvedLabel {
                                label: dep_label.clone(),
                            }
                        })?;
                        referenced_existing.insert(id, existing);
                        id
                    }
                };
                task.depends_on.insert(dep_id);
            }
        }

        self.reject_cycles(&drafts, &referenced_existing)?;

        // Aggregate estimate: subtask sum plus coordination overhead. For
        // reporting only — it never blocks scheduling.
        let summed: u64 = drafts
            .iter()
            .filter_map(|(_, t)| t.estimated_duration)
            .map(|d| d.as_secs())
            .sum();
        if summed > 0 {
            let aggregate =
                Duration::from_secs_f64(summed as f64 * self.config.coordination_overhead);
            self.tasks
                .mutate_fields(parent_id, move |t| {
                    t.estimated_duration = Some(aggregate);
                })
                .await?;
        }

        let subtasks: Vec<Task> = drafts.into_iter().map(|(_, t)| t).collect();
        self.store.insert_tasks(&subtasks).await?;
        info!(
            parent_id = %parent_id,
            count = subtasks.len(),
            "Decomposed task into subtask batch"
        );

        // Subtasks with no unmet dependencies go straight to Ready.
        let mut ids = Vec::with_capacity(subtasks.len());
        for subtask in &subtasks {
            self.tasks.promote_if_ready(subtask.id).await?;
            ids.push(subtask.id);
        }
        Ok(ids)
    }

    fn normalize(
        &self,
        parent: &Task,
        descriptor: &SubtaskDescriptor,
    ) -> Result<Task> {
        let mut draft = TaskDraft::new(
            descriptor.title.clone(),
            descriptor.task_type,
            parent.created_by.clone(),
        );
        draft.description = descriptor.description.clone();
        draft.priority = descriptor.priority;
        draft.parent_id = Some(parent.id);
        draft.required_capabilities = descriptor.required_capabilities.iter().cloned().collect();
        draft.allow_partial_upstream = descriptor.allow_partial_upstream;
        draft.input = descriptor.input.clone();
        draft.estimated_duration = descriptor
            .estimated_duration_minutes
            .map(|m| Duration::from_secs(m * 60));
        draft.max_retries = descriptor
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        Task::from_draft(draft).map_err(Error::Validation)
    }

    /// DFS with recursion-stack marking over the combined graph of new
    /// subtasks and the pre-existing tasks they reference.
    fn reject_cycles(
        &self,
        drafts: &[(SubtaskDescriptor, Task)],
        referenced_existing: &HashMap<Uuid, Task>,
    ) -> Result<()> {
        let mut edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut labels: HashMap<Uuid, String> = HashMap::new();
        for (descriptor, task) in drafts {
            edges.insert(task.id, task.depends_on.iter().copied().collect());
            labels.insert(task.id, descriptor.label.clone());
        }
        for (id, task) in referenced_existing {
            edges.insert(*id, task.depends_on.iter().copied().collect());
        }

        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut on_stack: HashSet<Uuid> = HashSet::new();

        fn visit(
            node: Uuid,
            edges: &HashMap<Uuid, Vec<Uuid>>,
            visited: &mut HashSet<Uuid>,
            on_stack: &mut HashSet<Uuid>,
        ) -> Option<Uuid> {
            if on_stack.contains(&node) {
                return Some(node);
            }
            if !visited.insert(node) {
                return None;
            }
            on_stack.insert(node);
            if let Some(deps) = edges.get(&node) {
                for dep in deps {
                    if let Some(cycle_node) = visit(*dep, edges, visited, on_stack) {
                        return Some(cycle_node);
                    }
                }
            }
            on_stack.remove(&node);
            None
        }

        for node in edges.keys() {
            if let Some(cycle_node) = visit(*node, &edges, &mut visited, &mut on_stack) {
                let label = labels
                    .get(&cycle_node)
                    .cloned()
                    .unwrap_or_else(|| cycle_node.to_string());
                return Err(DecompositionError::CycleDetected { label }.into());
            }
        }
        Ok(())
    }

    /// Advisory complexity heuristic: payload size, capability count, and
    /// requirement-text length, weighted against the configured threshold.
    pub fn analyze_for_splitting(&self, task: &Task) -> SplitAnalysis {
        let payload_kib = task.input.approx_size() as f64 / 1024.0;
        let capability_count = task.required_capabilities.len() as f64;
        let text_hundreds = task.description.len() as f64 / 100.0;

        let score = payload_kib * self.config.split_payload_weight
            + capability_count * self.config.split_capability_weight
            + text_hundreds * self.config.split_text_weight;
        SplitAnalysis {
            score,
            threshold: self.config.split_threshold,
            should_split: score > self.config.split_threshold,
        }
    }
}
