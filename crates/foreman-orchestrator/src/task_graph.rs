use crate::types::{Task, TaskArtifacts, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Serializable image of a [`TaskGraph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Every task, in insertion order.
    pub tasks: Vec<Task>,
    /// Sequence number the next enqueued task receives.
    pub next_sequence: u64,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// A dependency graph of tasks with a validated status lifecycle.
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    next_sequence: u64,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            dependents: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Add a task. Every dependency must already be in the graph, which
    /// also rules out cycles for graphs built through this method.
    pub fn enqueue(&mut self, mut task: Task) -> ForemanResult<TaskId> {
        if self.tasks.contains_key(&task.id) {
            return Err(ForemanError::DuplicateTask(task.id.to_string()));
        }
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|dep| !self.tasks.contains_key(*dep))
        {
            return Err(ForemanError::InvalidDependency {
                task: task.id.to_string(),
                dependency: missing.to_string(),
            });
        }

        task.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        task.status = if self.deps_completed(&task) {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };

        let id = task.id.clone();
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(id.clone());
        }
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Ready → Running.
    pub fn mark_running(&mut self, id: &TaskId) -> ForemanResult<()> {
        self.transition(id, TaskStatus::Running, |s| matches!(s, TaskStatus::Ready))
    }

    /// Running → AwaitingReview.
    pub fn mark_awaiting_review(&mut self, id: &TaskId) -> ForemanResult<()> {
        self.transition(id, TaskStatus::AwaitingReview, |s| {
            matches!(s, TaskStatus::Running)
        })
    }

    /// AwaitingReview → Running, for another round after feedback.
    pub fn mark_rework(&mut self, id: &TaskId) -> ForemanResult<()> {
        self.transition(id, TaskStatus::Running, |s| {
            matches!(s, TaskStatus::AwaitingReview)
        })
    }

    /// Mark a task completed and promote the dependents it unblocked.
    ///
    /// Returns the ids of tasks that moved from Pending to Ready.
    pub fn mark_completed(&mut self, id: &TaskId) -> ForemanResult<Vec<TaskId>> {
        self.transition(id, TaskStatus::Completed, |s| {
            matches!(s, TaskStatus::Running | TaskStatus::AwaitingReview)
        })?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.completed_at = Some(Utc::now());
        }

        let mut promoted = Vec::new();
        for dependent in self.dependents.get(id).cloned().unwrap_or_default() {
            let ready = self
                .tasks
                .get(&dependent)
                .is_some_and(|t| t.status == TaskStatus::Pending && self.deps_completed(t));
            if ready {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.status = TaskStatus::Ready;
                }
                promoted.push(dependent);
            }
        }
        Ok(promoted)
    }

    /// Mark a non-terminal task failed. Dependents stay blocked.
    pub fn mark_failed(&mut self, id: &TaskId, reason: impl Into<String>) -> ForemanResult<()> {
        let status = TaskStatus::Failed {
            reason: reason.into(),
        };
        self.transition(id, status, |s| !s.is_terminal())
    }

    /// Mark a non-terminal task skipped. Dependents stay blocked.
    pub fn mark_skipped(&mut self, id: &TaskId, reason: impl Into<String>) -> ForemanResult<()> {
        let status = TaskStatus::Skipped {
            reason: reason.into(),
        };
        self.transition(id, status, |s| !s.is_terminal())
    }

    /// Record how many review rounds ended in feedback.
    pub fn record_review_iteration(&mut self, id: &TaskId, iterations: u32) -> ForemanResult<()> {
        self.get_mut(id)?.review_iterations = iterations;
        Ok(())
    }

    /// Failed → Ready (or Pending), with the review counter cleared.
    pub fn reset_failed(&mut self, id: &TaskId) -> ForemanResult<()> {
        let ready = self.deps_completed(self.get(id)?);
        let next = if ready {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        self.transition(id, next, |s| matches!(s, TaskStatus::Failed { .. }))?;
        let task = self.get_mut(id)?;
        task.review_iterations = 0;
        task.waited_rounds = 0;
        Ok(())
    }

    /// Store a computed priority.
    pub fn set_priority(&mut self, id: &TaskId, priority: f64) -> ForemanResult<()> {
        self.get_mut(id)?.priority = priority;
        Ok(())
    }

    /// Count one more scheduling round in which the task was passed over.
    pub fn bump_waited(&mut self, id: &TaskId) -> ForemanResult<()> {
        let task = self.get_mut(id)?;
        task.waited_rounds = task.waited_rounds.saturating_add(1);
        Ok(())
    }

    /// Replace the artifacts of a task.
    pub fn update_artifacts(&mut self, id: &TaskId, artifacts: TaskArtifacts) -> ForemanResult<()> {
        self.get_mut(id)?.artifacts = artifacts;
        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &TaskId) -> ForemanResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| ForemanError::UnknownTask(id.to_string()))
    }

    fn get_mut(&mut self, id: &TaskId) -> ForemanResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| ForemanError::UnknownTask(id.to_string()))
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    /// Tasks in `Ready`, in insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect()
    }

    /// Number of tasks whose status matches `pred`.
    pub fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.tasks.values().filter(|t| pred(&t.status)).count()
    }

    /// Total number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph holds no task.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every task that directly or indirectly depends on `id`.
    pub fn transitive_dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&TaskId> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// Whether a pending task can never become ready because an ancestor
    /// failed or was skipped.
    pub fn is_stranded(&self, id: &TaskId) -> bool {
        let Some(task) = self.tasks.get(id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        let mut stack: Vec<&TaskId> = task.dependencies.iter().collect();
        let mut seen = HashSet::new();
        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if let Some(t) = self.tasks.get(dep) {
                if matches!(
                    t.status,
                    TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
                ) {
                    return true;
                }
                stack.extend(t.dependencies.iter());
            }
        }
        false
    }

    /// Check for cycles in the dependency graph.
    /// Returns true if a cycle is detected.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for id in &self.order {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(&'a self, id: &'a TaskId, visited: &mut HashMap<&'a TaskId, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Verify the structural invariants: dependencies exist, no cycle,
    /// Ready implies all dependencies completed, and no Pending task is
    /// left behind with all of its dependencies completed.
    pub fn check_invariants(&self) -> ForemanResult<()> {
        for task in self.tasks.values() {
            if let Some(missing) = task
                .dependencies
                .iter()
                .find(|dep| !self.tasks.contains_key(*dep))
            {
                return Err(ForemanError::InvalidDependency {
                    task: task.id.to_string(),
                    dependency: missing.to_string(),
                });
            }
        }
        if self.has_cycle() {
            return Err(ForemanError::Orchestrator(
                "dependency cycle in task graph".into(),
            ));
        }
        for task in self.tasks.values() {
            let deps_done = self.deps_completed(task);
            match task.status {
                TaskStatus::Ready if !deps_done => {
                    return Err(ForemanError::Orchestrator(format!(
                        "task '{}' is ready with incomplete dependencies",
                        task.id
                    )));
                }
                TaskStatus::Pending if deps_done => {
                    return Err(ForemanError::Orchestrator(format!(
                        "task '{}' is pending although its dependencies completed",
                        task.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Capture the graph for persistence.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            tasks: self.all_tasks().into_iter().cloned().collect(),
            next_sequence: self.next_sequence,
            taken_at: Utc::now(),
        }
    }

    /// Rebuild a graph from a snapshot, re-validating its invariants.
    pub fn restore(snapshot: GraphSnapshot) -> ForemanResult<Self> {
        let mut graph = Self::new();
        for task in snapshot.tasks {
            if graph.tasks.contains_key(&task.id) {
                return Err(ForemanError::DuplicateTask(task.id.to_string()));
            }
            let id = task.id.clone();
            for dep in &task.dependencies {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(id.clone());
            }
            graph.next_sequence = graph.next_sequence.max(task.sequence.saturating_add(1));
            graph.order.push(id.clone());
            graph.tasks.insert(id, task);
        }
        graph.next_sequence = graph.next_sequence.max(snapshot.next_sequence);
        graph.check_invariants()?;
        Ok(graph)
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    fn transition(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        allowed: impl Fn(&TaskStatus) -> bool,
    ) -> ForemanResult<()> {
        let task = self.get_mut(id)?;
        if !allowed(&task.status) {
            return Err(ForemanError::InvalidTransition {
                task: id.to_string(),
                from: task.status.label().to_string(),
                to: to.label().to_string(),
            });
        }
        task.status = to;
        Ok(())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}
